use std::{cmp::Ordering, fmt, sync::Arc};

use rust_decimal::{Decimal, RoundingStrategy};
use time::Date;

use crate::{
    context::{AccountId, CommodityId, Context},
    period::{periods, Interval},
};

/// A range of source locations in a journal file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Range {
    pub path: Arc<str>,
    pub start: usize,
    pub end: usize,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.path, self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    pub range: Range,
    pub date: Date,
    pub account: AccountId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Close {
    pub range: Range,
    pub date: Date,
    pub account: AccountId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Price {
    pub range: Range,
    pub date: Date,
    pub commodity: CommodityId,
    pub price: Decimal,
    pub target: CommodityId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assertion {
    pub range: Range,
    pub date: Date,
    pub account: AccountId,
    pub amount: Decimal,
    pub commodity: CommodityId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub range: Range,
    pub date: Date,
    pub account: AccountId,
    pub amount: Decimal,
    pub commodity: CommodityId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    pub range: Range,
    pub path: Arc<str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Currency {
    pub range: Range,
    pub date: Date,
    pub commodity: CommodityId,
}

/// A lot annotation on a posting.
#[derive(Debug, Clone, PartialEq)]
pub struct Lot {
    pub date: Date,
    pub label: Option<Arc<str>>,
    pub price: Decimal,
    pub commodity: CommodityId,
}

/// One credit-debit-commodity-amount tuple within a transaction.
///
/// The amount is never negative; constructing a posting with a negative
/// amount swaps credit and debit. The value is filled by the valuator.
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub credit: AccountId,
    pub debit: AccountId,
    pub commodity: CommodityId,
    pub amount: Decimal,
    pub value: Decimal,
    pub targets: Option<Vec<CommodityId>>,
    pub lot: Option<Lot>,
}

impl Posting {
    pub fn new(
        credit: AccountId,
        debit: AccountId,
        commodity: CommodityId,
        amount: Decimal,
    ) -> Posting {
        let (credit, debit, amount) = if amount.is_sign_negative() {
            (debit, credit, -amount)
        } else {
            (credit, debit, amount)
        };
        Posting {
            credit,
            debit,
            commodity,
            amount,
            value: Decimal::ZERO,
            targets: None,
            lot: None,
        }
    }

    pub fn with_targets(mut self, targets: Vec<CommodityId>) -> Posting {
        self.targets = Some(targets);
        self
    }

    pub fn with_lot(mut self, lot: Lot) -> Posting {
        self.lot = Some(lot);
        self
    }

    /// Lexicographic order by credit name, debit name, amount, commodity name.
    pub fn compare(&self, other: &Posting, ctx: &Context) -> Ordering {
        ctx.account_name(self.credit)
            .cmp(&ctx.account_name(other.credit))
            .then_with(|| ctx.account_name(self.debit).cmp(&ctx.account_name(other.debit)))
            .then_with(|| self.amount.cmp(&other.amount))
            .then_with(|| {
                ctx.commodity_name(self.commodity)
                    .cmp(&ctx.commodity_name(other.commodity))
            })
    }
}

/// Addon attached to a transaction by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum AddOn {
    Accrual(Accrual),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub range: Range,
    pub date: Date,
    pub description: Arc<str>,
    pub tags: Vec<Arc<str>>,
    pub postings: Vec<Posting>,
    pub addons: Vec<AddOn>,
}

impl Transaction {
    pub fn compare(&self, other: &Transaction, ctx: &Context) -> Ordering {
        self.date
            .cmp(&other.date)
            .then_with(|| self.description.cmp(&other.description))
            .then_with(|| {
                for (p, q) in self.postings.iter().zip(other.postings.iter()) {
                    let ord = p.compare(q, ctx);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                self.postings.len().cmp(&other.postings.len())
            })
    }
}

/// An accrual spec: spreads a single-posting transaction over the periods
/// of an interval, routed through an accrual account.
#[derive(Debug, Clone, PartialEq)]
pub struct Accrual {
    pub range: Range,
    pub interval: Interval,
    pub t0: Date,
    pub t1: Date,
    pub account: AccountId,
}

impl Accrual {
    /// Expands the accrued transaction. The sum of the expansion equals the
    /// original amount; the division remainder lands on the first period.
    pub fn expand(&self, ctx: &Context, t: &Transaction) -> Vec<Transaction> {
        let posting = &t.postings[0];
        let mut cr_single = self.account;
        let mut dr_single = self.account;
        let mut cr_multi = self.account;
        let mut dr_multi = self.account;
        let (cr_al, dr_al) = (ctx.is_al(posting.credit), ctx.is_al(posting.debit));
        let (cr_ie, dr_ie) = (ctx.is_ie(posting.credit), ctx.is_ie(posting.debit));
        if cr_al && dr_ie {
            cr_single = posting.credit;
            dr_multi = posting.debit;
        } else if cr_ie && dr_al {
            cr_multi = posting.credit;
            dr_single = posting.debit;
        } else if cr_ie && dr_ie {
            cr_multi = posting.credit;
            dr_multi = posting.debit;
        } else {
            cr_single = posting.credit;
            dr_single = posting.debit;
        }

        let periods = periods(self.t0, self.t1, self.interval);
        let n = Decimal::from(periods.len() as i64);
        let share = (posting.amount / n).round_dp_with_strategy(1, RoundingStrategy::ToZero);
        let rem = posting.amount - share * n;

        let mut result = Vec::new();
        if cr_multi != dr_multi {
            for (i, period) in periods.iter().enumerate() {
                let mut amount = share;
                if i == 0 {
                    amount += rem;
                }
                result.push(Transaction {
                    range: t.range.clone(),
                    date: period.end,
                    description: Arc::from(format!(
                        "{} (accrual {}/{})",
                        t.description,
                        i + 1,
                        periods.len()
                    )),
                    tags: t.tags.clone(),
                    postings: vec![Posting::new(cr_multi, dr_multi, posting.commodity, amount)],
                    addons: Vec::new(),
                });
            }
        }
        if cr_single != dr_single {
            result.push(Transaction {
                range: t.range.clone(),
                date: t.date,
                description: t.description.clone(),
                tags: t.tags.clone(),
                postings: vec![Posting::new(
                    cr_single,
                    dr_single,
                    posting.commodity,
                    posting.amount,
                )],
                addons: Vec::new(),
            });
        }
        result
    }
}

/// One top-level journal element.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Open(Open),
    Close(Close),
    Price(Price),
    Transaction(Transaction),
    Assertion(Assertion),
    Value(Value),
    Include(Include),
    Currency(Currency),
}

impl Directive {
    pub fn range(&self) -> &Range {
        match self {
            Directive::Open(d) => &d.range,
            Directive::Close(d) => &d.range,
            Directive::Price(d) => &d.range,
            Directive::Transaction(d) => &d.range,
            Directive::Assertion(d) => &d.range,
            Directive::Value(d) => &d.range,
            Directive::Include(d) => &d.range,
            Directive::Currency(d) => &d.range,
        }
    }

    /// The directive date; includes carry none.
    pub fn date(&self) -> Option<Date> {
        match self {
            Directive::Open(d) => Some(d.date),
            Directive::Close(d) => Some(d.date),
            Directive::Price(d) => Some(d.date),
            Directive::Transaction(d) => Some(d.date),
            Directive::Assertion(d) => Some(d.date),
            Directive::Value(d) => Some(d.date),
            Directive::Include(_) => None,
            Directive::Currency(d) => Some(d.date),
        }
    }
}
