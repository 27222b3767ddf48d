use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use regex::Regex;
use time::Date;
use tokio::sync::mpsc;

use crate::{
    amounts::Positions,
    ast::{AddOn, Assertion, Close, Currency, Directive, Open, Posting, Price, Transaction, Value},
    context::{AccountId, CommodityId, Context},
    lexer,
    performance::Performance,
    pipeline::{push, ProcessError, Source},
    prices::NormalizedPrices,
};

/// All directives dated on a single calendar day, plus the state slots
/// filled by later pipeline stages.
#[derive(Debug, Clone)]
pub struct Day {
    pub date: Date,
    pub prices: Vec<Price>,
    pub assertions: Vec<Assertion>,
    pub values: Vec<Value>,
    pub openings: Vec<Open>,
    pub transactions: Vec<Transaction>,
    pub closings: Vec<Close>,

    /// Cumulative position amounts after balancing.
    pub amounts: Positions,
    /// Cumulative position values after valuation.
    pub value: Positions,
    /// Prices normalized to the valuation commodity, as of this day.
    pub normalized: Option<Arc<NormalizedPrices>>,
    /// Portfolio flows, when performance computation is enabled.
    pub performance: Option<Performance>,
}

impl Day {
    pub fn new(date: Date) -> Day {
        Day {
            date,
            prices: Vec::new(),
            assertions: Vec::new(),
            values: Vec::new(),
            openings: Vec::new(),
            transactions: Vec::new(),
            closings: Vec::new(),
            amounts: Positions::new(),
            value: Positions::new(),
            normalized: None,
            performance: None,
        }
    }
}

/// The unprocessed journal: days indexed by date.
pub struct Journal {
    ctx: Context,
    days: BTreeMap<Date, Day>,
    min: Option<Date>,
    max: Option<Date>,
}

impl Journal {
    pub fn new(ctx: Context) -> Journal {
        Journal {
            ctx,
            days: BTreeMap::new(),
            min: None,
            max: None,
        }
    }

    /// The day bucket for the given date, materialised on first use.
    pub fn day(&mut self, date: Date) -> &mut Day {
        self.min = Some(self.min.map_or(date, |d| d.min(date)));
        self.max = Some(self.max.map_or(date, |d| d.max(date)));
        self.days.entry(date).or_insert_with(|| Day::new(date))
    }

    pub fn add_open(&mut self, o: Open) {
        self.day(o.date).openings.push(o);
    }

    pub fn add_price(&mut self, p: Price) {
        self.day(p.date).prices.push(p);
    }

    pub fn add_transaction(&mut self, t: Transaction) {
        self.day(t.date).transactions.push(t);
    }

    pub fn add_assertion(&mut self, a: Assertion) {
        self.day(a.date).assertions.push(a);
    }

    pub fn add_value(&mut self, v: Value) {
        self.day(v.date).values.push(v);
    }

    pub fn add_close(&mut self, c: Close) {
        self.day(c.date).closings.push(c);
    }

    pub fn min_date(&self) -> Option<Date> {
        self.min
    }

    pub fn max_date(&self) -> Option<Date> {
        self.max
    }

    /// All days in date order, transactions within each day sorted by
    /// (date, description, postings).
    pub fn into_sorted_days(self) -> Vec<Day> {
        let ctx = self.ctx;
        self.days
            .into_values()
            .map(|mut day| {
                day.transactions.sort_by(|a, b| a.compare(b, &ctx));
                day
            })
            .collect()
    }
}

/// Regex predicates over account and commodity names. An absent pattern
/// matches everything.
#[derive(Clone, Default)]
pub struct AccountCommodityFilter {
    pub accounts: Option<Regex>,
    pub commodities: Option<Regex>,
}

impl AccountCommodityFilter {
    pub fn match_account(&self, ctx: &Context, account: AccountId) -> bool {
        match &self.accounts {
            Some(re) => re.is_match(&ctx.account_name(account)),
            None => true,
        }
    }

    pub fn match_commodity(&self, ctx: &Context, commodity: CommodityId) -> bool {
        match &self.commodities {
            Some(re) => re.is_match(&ctx.commodity_name(commodity)),
            None => true,
        }
    }

    /// A posting passes when either side matches the account predicate and
    /// its commodity matches the commodity predicate.
    pub fn match_posting(&self, ctx: &Context, p: &Posting) -> bool {
        (self.match_account(ctx, p.credit) || self.match_account(ctx, p.debit))
            && self.match_commodity(ctx, p.commodity)
    }
}

/// Parses the journal file hierarchy rooted at `path`, resolving includes
/// relative to the including file.
pub fn parse_files(ctx: &Context, path: &Path) -> Result<Vec<Directive>, ProcessError> {
    let mut res = Vec::new();
    parse_file(ctx, path, &mut res)?;
    Ok(res)
}

fn parse_file(ctx: &Context, path: &Path, out: &mut Vec<Directive>) -> Result<(), ProcessError> {
    let text = std::fs::read_to_string(path)?;
    let directives = lexer::parse(ctx, &path.to_string_lossy(), &text)?;
    for directive in directives {
        match directive {
            Directive::Include(inc) => {
                let target = path
                    .parent()
                    .unwrap_or_else(|| Path::new(""))
                    .join(inc.path.as_ref());
                parse_file(ctx, &target, out)?;
            }
            d => out.push(d),
        }
    }
    Ok(())
}

/// Source stage: parses the journal, groups directives by day, expands
/// accruals, applies the account/commodity filter and emits days in
/// ascending date order.
pub struct JournalSource {
    pub ctx: Context,
    pub path: PathBuf,
    pub filter: AccountCommodityFilter,
    pub expand: bool,
}

impl JournalSource {
    fn build(&self) -> Result<Journal, ProcessError> {
        let ctx = &self.ctx;
        let mut journal = Journal::new(ctx.clone());
        for directive in parse_files(ctx, &self.path)? {
            match directive {
                Directive::Open(o) => journal.add_open(o),
                Directive::Price(p) => journal.add_price(p),
                Directive::Currency(Currency { commodity, .. }) => ctx.set_currency(commodity),
                Directive::Transaction(mut t) => {
                    t.postings.retain(|p| self.filter.match_posting(ctx, p));
                    if t.postings.is_empty() {
                        continue;
                    }
                    if self.expand && !t.addons.is_empty() {
                        for addon in std::mem::take(&mut t.addons) {
                            let AddOn::Accrual(accrual) = addon;
                            for expanded in accrual.expand(ctx, &t) {
                                journal.add_transaction(expanded);
                            }
                        }
                    } else {
                        journal.add_transaction(t);
                    }
                }
                Directive::Assertion(a) => {
                    if self.filter.match_account(ctx, a.account)
                        && self.filter.match_commodity(ctx, a.commodity)
                    {
                        journal.add_assertion(a);
                    }
                }
                Directive::Value(v) => {
                    if self.filter.match_account(ctx, v.account)
                        && self.filter.match_commodity(ctx, v.commodity)
                    {
                        journal.add_value(v);
                    }
                }
                Directive::Close(c) => {
                    if self.filter.match_account(ctx, c.account) {
                        journal.add_close(c);
                    }
                }
                Directive::Include(_) => unreachable!("includes are resolved by the parser"),
            }
        }
        Ok(journal)
    }
}

#[async_trait]
impl Source for JournalSource {
    fn name(&self) -> &'static str {
        "journal source"
    }

    async fn run(&mut self, out: mpsc::Sender<Day>) -> Result<(), ProcessError> {
        let journal = self.build()?;
        log::debug!(
            "parsed journal {}: {:?}..{:?}",
            self.path.display(),
            journal.min_date(),
            journal.max_date()
        );
        for day in journal.into_sorted_days() {
            push(&out, day).await?;
        }
        Ok(())
    }
}
