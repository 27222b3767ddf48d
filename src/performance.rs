use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use regex::Regex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::{
    ast::Transaction,
    context::{AccountId, CommodityId, Context},
    journal::Day,
    pipeline::{push, ProcessError, Stage},
};

/// Per-day portfolio flows, used to compute time-weighted performance.
///
/// `v0`/`v1` hold the portfolio value per commodity at the start and end
/// of the day. External flows cross the portfolio boundary into other
/// asset or liability accounts; internal flows (purchases, sales,
/// conversions, dividends, fees) shift value between commodities inside
/// it and net to zero per transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Performance {
    pub v0: HashMap<CommodityId, Decimal>,
    pub v1: HashMap<CommodityId, Decimal>,
    pub inflow: HashMap<CommodityId, Decimal>,
    pub outflow: HashMap<CommodityId, Decimal>,
    pub internal_inflow: HashMap<CommodityId, Decimal>,
    pub internal_outflow: HashMap<CommodityId, Decimal>,
    pub portfolio_inflow: Decimal,
    pub portfolio_outflow: Decimal,
}

/// Computes the flows of a portfolio (a set of asset/liability accounts
/// given by a regex) against the rest of the world.
pub struct FlowComputer {
    pub ctx: Context,
    pub valuation: CommodityId,
    pub portfolio: Regex,
}

impl FlowComputer {
    fn in_portfolio(&self, account: AccountId) -> bool {
        self.ctx.is_al(account) && self.portfolio.is_match(&self.ctx.account_name(account))
    }

    /// Classifies one day's postings into flows.
    pub fn flows(&self, day: &Day) -> Performance {
        let mut perf = Performance::default();
        for t in &day.transactions {
            self.transaction_flows(t, &mut perf);
        }
        perf
    }

    /// Books one transaction. Legs against other asset/liability accounts
    /// are external flows. Legs routed through equity, income or expense
    /// accounts are internal: they are netted per commodity across the
    /// transaction, and the residual pricing imbalance is absorbed by the
    /// non-currency legs (the securities), or split across the
    /// non-valuation currency legs of a pure conversion.
    fn transaction_flows(&self, t: &Transaction, perf: &mut Performance) {
        let mut internal: BTreeMap<CommodityId, Decimal> = BTreeMap::new();
        for p in &t.postings {
            let credit_in = self.in_portfolio(p.credit);
            let debit_in = self.in_portfolio(p.debit);
            if credit_in == debit_in {
                continue;
            }
            let (value, counterparty) = if debit_in {
                (p.value, p.credit)
            } else {
                (-p.value, p.debit)
            };
            if value.is_zero() {
                continue;
            }
            if self.ctx.is_al(counterparty) {
                if value.is_sign_positive() {
                    *perf.inflow.entry(p.commodity).or_default() += value;
                    perf.portfolio_inflow += value;
                } else {
                    *perf.outflow.entry(p.commodity).or_default() += value;
                    perf.portfolio_outflow += value;
                }
                continue;
            }
            *internal.entry(p.commodity).or_default() += value;
            if let Some(target) = p.targets.as_ref().and_then(|ts| ts.first()) {
                *internal.entry(*target).or_default() -= value;
            }
        }
        if internal.is_empty() {
            return;
        }
        internal.retain(|_, v| !v.is_zero());
        let imbalance: Decimal = internal.values().copied().sum();
        if !imbalance.is_zero() {
            let mut candidates: Vec<CommodityId> = internal
                .keys()
                .copied()
                .filter(|c| !self.ctx.is_currency(*c))
                .collect();
            if candidates.is_empty() {
                candidates = internal
                    .keys()
                    .copied()
                    .filter(|c| *c != self.valuation)
                    .collect();
            }
            if !candidates.is_empty() {
                let share = imbalance / Decimal::from(candidates.len() as i64);
                for c in candidates {
                    *internal.get_mut(&c).unwrap() -= share;
                }
            }
        }
        for (commodity, value) in internal {
            if value.is_zero() {
                continue;
            }
            if value.is_sign_positive() {
                *perf.internal_inflow.entry(commodity).or_default() += value;
            } else {
                *perf.internal_outflow.entry(commodity).or_default() += value;
            }
        }
    }

    fn portfolio_value(&self, day: &Day) -> HashMap<CommodityId, Decimal> {
        let mut res = HashMap::new();
        for ((account, commodity), value) in day.value.iter() {
            if self.in_portfolio(*account) {
                *res.entry(*commodity).or_default() += *value;
            }
        }
        res
    }
}

#[async_trait]
impl Stage for FlowComputer {
    fn name(&self) -> &'static str {
        "flow computer"
    }

    async fn run(
        &mut self,
        mut input: mpsc::Receiver<Day>,
        out: mpsc::Sender<Day>,
    ) -> Result<(), ProcessError> {
        let mut previous: HashMap<CommodityId, Decimal> = HashMap::new();
        while let Some(mut day) = input.recv().await {
            let mut perf = self.flows(&day);
            perf.v0 = previous;
            perf.v1 = self.portfolio_value(&day);
            previous = perf.v1.clone();
            day.performance = Some(perf);
            push(&out, day).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Posting, Range};
    use std::sync::Arc;
    use time::macros::date;

    struct Setup {
        ctx: Context,
        chf: CommodityId,
        usd: CommodityId,
        gbp: CommodityId,
        aapl: CommodityId,
        portfolio: AccountId,
        acc1: AccountId,
        acc2: AccountId,
        dividend: AccountId,
        expense: AccountId,
        equity: AccountId,
    }

    fn setup() -> Setup {
        let ctx = Context::new();
        let chf = ctx.commodity("CHF").unwrap();
        let usd = ctx.commodity("USD").unwrap();
        let gbp = ctx.commodity("GBP").unwrap();
        let aapl = ctx.commodity("AAPL").unwrap();
        ctx.set_currency(chf);
        ctx.set_currency(usd);
        ctx.set_currency(gbp);
        Setup {
            portfolio: ctx.account("Assets:Portfolio").unwrap(),
            acc1: ctx.account("Assets:Acc1").unwrap(),
            acc2: ctx.account("Assets:Acc2").unwrap(),
            dividend: ctx.account("Income:Dividends").unwrap(),
            expense: ctx.account("Expenses:Investments").unwrap(),
            equity: ctx.account("Equity:Equity").unwrap(),
            ctx,
            chf,
            usd,
            gbp,
            aapl,
        }
    }

    fn computer(s: &Setup) -> FlowComputer {
        FlowComputer {
            ctx: s.ctx.clone(),
            valuation: s.chf,
            portfolio: Regex::new("Assets:Portfolio").unwrap(),
        }
    }

    fn posting(
        credit: AccountId,
        debit: AccountId,
        commodity: CommodityId,
        amount: i64,
        value: i64,
    ) -> Posting {
        let mut p = Posting::new(credit, debit, commodity, Decimal::from(amount));
        p.value = Decimal::from(value);
        p
    }

    fn day_with(postings: Vec<Posting>) -> Day {
        let mut day = Day::new(date!(2021 - 11 - 15));
        day.transactions.push(Transaction {
            range: Range::default(),
            date: day.date,
            description: Arc::from("flows"),
            tags: Vec::new(),
            postings,
            addons: Vec::new(),
        });
        day
    }

    fn flows(s: &Setup, postings: Vec<Posting>) -> Performance {
        computer(s).flows(&day_with(postings))
    }

    fn pcv(entries: &[(CommodityId, i64)]) -> HashMap<CommodityId, Decimal> {
        entries.iter().map(|(c, v)| (*c, Decimal::from(*v))).collect()
    }

    #[test]
    fn test_outflow() {
        let s = setup();
        let perf = flows(&s, vec![posting(s.portfolio, s.acc2, s.usd, 2, 1)]);
        assert_eq!(perf.outflow, pcv(&[(s.usd, -1)]));
        assert!(perf.inflow.is_empty());
        assert!(perf.internal_inflow.is_empty());
        assert!(perf.internal_outflow.is_empty());
    }

    #[test]
    fn test_inflow() {
        let s = setup();
        let perf = flows(&s, vec![posting(s.acc1, s.portfolio, s.usd, 2, 1)]);
        assert_eq!(perf.inflow, pcv(&[(s.usd, 1)]));
        assert!(perf.outflow.is_empty());
    }

    #[test]
    fn test_dividend() {
        let s = setup();
        let mut p = posting(s.dividend, s.portfolio, s.usd, 2, 1);
        p.targets = Some(vec![s.aapl]);
        let perf = flows(&s, vec![p]);
        assert_eq!(perf.internal_inflow, pcv(&[(s.usd, 1)]));
        assert_eq!(perf.internal_outflow, pcv(&[(s.aapl, -1)]));
    }

    #[test]
    fn test_expense() {
        let s = setup();
        let mut p = posting(s.portfolio, s.expense, s.usd, 2, 1);
        p.targets = Some(vec![s.aapl]);
        let perf = flows(&s, vec![p]);
        assert_eq!(perf.internal_inflow, pcv(&[(s.aapl, 1)]));
        assert_eq!(perf.internal_outflow, pcv(&[(s.usd, -1)]));
    }

    #[test]
    fn test_stock_purchase() {
        let s = setup();
        let perf = flows(
            &s,
            vec![
                posting(s.portfolio, s.equity, s.usd, 1100, 1010),
                posting(s.equity, s.portfolio, s.aapl, 1, 1000),
            ],
        );
        // The security leg absorbs the pricing imbalance.
        assert_eq!(perf.internal_inflow, pcv(&[(s.aapl, 1010)]));
        assert_eq!(perf.internal_outflow, pcv(&[(s.usd, -1010)]));
        assert!(perf.inflow.is_empty());
        assert!(perf.outflow.is_empty());
    }

    #[test]
    fn test_stock_purchase_with_fee() {
        let s = setup();
        let perf = flows(
            &s,
            vec![
                posting(s.portfolio, s.equity, s.usd, 1100, 1010),
                posting(s.equity, s.portfolio, s.aapl, 1, 1000),
                posting(s.portfolio, s.equity, s.usd, 10, 10),
            ],
        );
        assert_eq!(perf.internal_inflow, pcv(&[(s.aapl, 1020)]));
        assert_eq!(perf.internal_outflow, pcv(&[(s.usd, -1020)]));
    }

    #[test]
    fn test_stock_sale() {
        let s = setup();
        let perf = flows(
            &s,
            vec![
                posting(s.portfolio, s.equity, s.aapl, 1, 1000),
                posting(s.equity, s.portfolio, s.usd, 1100, 990),
            ],
        );
        assert_eq!(perf.internal_inflow, pcv(&[(s.usd, 990)]));
        assert_eq!(perf.internal_outflow, pcv(&[(s.aapl, -990)]));
    }

    #[test]
    fn test_forex_without_fee() {
        let s = setup();
        let perf = flows(
            &s,
            vec![
                posting(s.portfolio, s.equity, s.gbp, 1000, 1400),
                posting(s.equity, s.portfolio, s.usd, 1500, 1350),
            ],
        );
        // No security leg: the imbalance is split across the currencies.
        assert_eq!(perf.internal_outflow, pcv(&[(s.gbp, -1375)]));
        assert_eq!(perf.internal_inflow, pcv(&[(s.usd, 1375)]));
    }

    #[test]
    fn test_forex_with_fee() {
        let s = setup();
        let perf = flows(
            &s,
            vec![
                posting(s.portfolio, s.equity, s.gbp, 1000, 1400),
                posting(s.equity, s.portfolio, s.usd, 1500, 1350),
                posting(s.portfolio, s.expense, s.chf, 10, 10),
            ],
        );
        // The valuation commodity leg is exact and never adjusted.
        assert_eq!(perf.internal_outflow, pcv(&[(s.gbp, -1370), (s.chf, -10)]));
        assert_eq!(perf.internal_inflow, pcv(&[(s.usd, 1380)]));
    }

    #[test]
    fn test_forex_with_native_fee() {
        let s = setup();
        let perf = flows(
            &s,
            vec![
                posting(s.portfolio, s.equity, s.gbp, 1000, 1400),
                posting(s.equity, s.portfolio, s.usd, 1500, 1350),
                posting(s.portfolio, s.expense, s.usd, 10, 10),
            ],
        );
        assert_eq!(perf.internal_outflow, pcv(&[(s.gbp, -1370)]));
        assert_eq!(perf.internal_inflow, pcv(&[(s.usd, 1370)]));
    }

    #[test]
    fn test_transfer_inside_portfolio_is_ignored() {
        let s = setup();
        let a = s.ctx.account("Assets:Portfolio:A").unwrap();
        let b = s.ctx.account("Assets:Portfolio:B").unwrap();
        let perf = flows(&s, vec![posting(a, b, s.usd, 2, 1)]);
        assert_eq!(perf, Performance::default());
    }

    #[test]
    fn test_valuation_gain_postings_produce_no_flows() {
        let s = setup();
        // Gain postings carry their own commodity as target, so the pair
        // cancels and no flow is booked.
        let valuation_account = s.ctx.valuation_account_for(s.portfolio);
        let mut p = posting(valuation_account, s.portfolio, s.aapl, 0, 25);
        p.targets = Some(vec![s.aapl]);
        let perf = flows(&s, vec![p]);
        assert_eq!(perf, Performance::default());
    }
}
