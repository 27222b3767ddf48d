use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use prettytable::{row, Cell, Row, Table};
use regex::Regex;
use rust_decimal::Decimal;
use time::Date;
use tokio::sync::mpsc;

use crate::{
    context::{AccountId, AccountType, CommodityId, Context},
    journal::Day,
    pipeline::{ProcessError, Sink},
};

/// The key a posting side contributes to a report.
#[derive(Debug, Clone)]
pub struct Key {
    pub date: Date,
    pub account: AccountId,
    pub other: AccountId,
    pub commodity: CommodityId,
    pub valuation: Option<CommodityId>,
    pub description: Arc<str>,
}

pub type Filter = Box<dyn Fn(&Key) -> bool + Send>;
pub type Mapper = Box<dyn Fn(Key) -> Key + Send>;

/// Anything that can accumulate keyed decimals.
pub trait Collection {
    fn insert(&mut self, key: Key, value: Decimal);
}

/// An account remapping rule: accounts matching the pattern are shortened
/// to their ancestor at the given segment depth.
#[derive(Clone)]
pub struct MappingRule {
    pub level: usize,
    pub pattern: Regex,
}

impl MappingRule {
    /// Parses the `<level>,<regex>` CLI form.
    pub fn parse(s: &str) -> Result<MappingRule, String> {
        let (level, pattern) = s
            .split_once(',')
            .ok_or_else(|| format!("expected <level>,<regex>, got {:?}", s))?;
        Ok(MappingRule {
            level: level.parse().map_err(|e| format!("invalid level: {}", e))?,
            pattern: Regex::new(pattern).map_err(|e| e.to_string())?,
        })
    }

    pub fn apply(&self, ctx: &Context, account: AccountId) -> Option<AccountId> {
        if self.pattern.is_match(&ctx.account_name(account)) {
            Some(ctx.ancestor(account, self.level))
        } else {
            None
        }
    }
}

fn map_account(ctx: &Context, rules: &[MappingRule], account: AccountId) -> AccountId {
    for rule in rules {
        if let Some(mapped) = rule.apply(ctx, account) {
            return mapped;
        }
    }
    account
}

/// A mapper applying the first matching rule to the key's account.
pub fn account_mapper(ctx: Context, rules: Vec<MappingRule>) -> Mapper {
    Box::new(move |mut key| {
        key.account = map_account(&ctx, &rules, key.account);
        key
    })
}

/// Iterates every posting of every transaction, splits it into its credit
/// and debit sides, filters, maps and inserts into a collection.
pub struct Query {
    pub filter: Option<Filter>,
    pub mapper: Option<Mapper>,
    pub valuation: Option<CommodityId>,
}

impl Query {
    pub fn execute(&self, day: &Day, collection: &mut dyn Collection) {
        for t in &day.transactions {
            for p in &t.postings {
                let amount = match self.valuation {
                    Some(_) => p.value,
                    None => p.amount,
                };
                for (account, other, amount) in
                    [(p.credit, p.debit, -amount), (p.debit, p.credit, amount)]
                {
                    let key = Key {
                        date: t.date,
                        account,
                        other,
                        commodity: p.commodity,
                        valuation: self.valuation,
                        description: t.description.clone(),
                    };
                    if self.filter.as_ref().map_or(true, |f| f(&key)) {
                        let key = match &self.mapper {
                            Some(m) => m(key),
                            None => key,
                        };
                        collection.insert(key, amount);
                    }
                }
            }
        }
    }
}

/// Number formatting shared by the report renderers.
#[derive(Clone, Copy, Default)]
pub struct Format {
    pub thousands: bool,
    pub digits: Option<u32>,
    pub color: bool,
}

impl Format {
    fn cell(&self, value: Decimal) -> Cell {
        let mut v = value;
        if self.thousands {
            v /= Decimal::from(1000);
        }
        if let Some(digits) = self.digits {
            v = v.round_dp(digits);
        }
        let cell = Cell::new(&v.to_string()).style_spec("r");
        if self.color && v.is_sign_negative() && !v.is_zero() {
            cell.style_spec("rFr")
        } else {
            cell
        }
    }
}

/// Sink keeping each period snapshot day for the balance report.
#[derive(Clone, Default)]
pub struct BalanceBuilder {
    pub days: Arc<Mutex<Vec<Day>>>,
}

#[async_trait]
impl Sink for BalanceBuilder {
    fn name(&self) -> &'static str {
        "balance builder"
    }

    async fn run(&mut self, mut input: mpsc::Receiver<Day>) -> Result<(), ProcessError> {
        while let Some(day) = input.recv().await {
            self.days.lock().unwrap().push(day);
        }
        Ok(())
    }
}

/// Pivots period snapshots into one row per account (and commodity, when
/// shown), one column per period.
pub struct BalanceRenderer {
    pub ctx: Context,
    pub valuation: Option<CommodityId>,
    pub show_commodities: bool,
    pub sort_alphabetically: bool,
    pub mapping: Vec<MappingRule>,
    pub format: Format,
}

type RowKey = (AccountId, Option<CommodityId>);

impl BalanceRenderer {
    pub fn render(&self, days: &[Day]) -> Table {
        let ctx = &self.ctx;
        // Positions can only be aggregated across commodities once they
        // are valuated in a common one.
        let show_commodities = self.show_commodities || self.valuation.is_none();

        let mut cols: Vec<HashMap<RowKey, Decimal>> = Vec::with_capacity(days.len());
        let mut present: HashSet<RowKey> = HashSet::new();
        for day in days {
            let source = match self.valuation {
                Some(_) => &day.value,
                None => &day.amounts,
            };
            let mut col: HashMap<RowKey, Decimal> = HashMap::new();
            for ((account, commodity), amount) in source.iter() {
                let account = map_account(ctx, &self.mapping, *account);
                let key = (account, show_commodities.then_some(*commodity));
                *col.entry(key).or_insert(Decimal::ZERO) += *amount;
            }
            col.retain(|_, v| !v.is_zero());
            present.extend(col.keys().copied());
            cols.push(col);
        }

        let mut table = Table::new();
        let mut header = row!["Account"];
        for day in days {
            header.add_cell(Cell::new(&day.date.to_string()).style_spec("r"));
        }
        table.add_row(header);
        table.add_empty_row();

        let accounts: HashSet<AccountId> = present.iter().map(|(a, _)| *a).collect();
        for ty in [
            AccountType::Assets,
            AccountType::Liabilities,
            AccountType::Equity,
            AccountType::Income,
            AccountType::Expenses,
        ] {
            let section = self.section_accounts(ty, &accounts);
            if section.is_empty() {
                continue;
            }
            table.add_row(row![b->ty.to_string()]);
            for account in &section {
                let mut commodities: Vec<Option<CommodityId>> = present
                    .iter()
                    .filter(|(a, _)| a == account)
                    .map(|(_, c)| *c)
                    .collect();
                commodities.sort_by_key(|c| c.map(|c| ctx.commodity_name(c)));
                for commodity in commodities {
                    let label = match commodity {
                        Some(c) => format!(
                            "  {} {}",
                            ctx.account_name(*account),
                            ctx.commodity_name(c)
                        ),
                        None => format!("  {}", ctx.account_name(*account)),
                    };
                    let mut cells = vec![Cell::new(&label)];
                    for col in &cols {
                        let v = col
                            .get(&(*account, commodity))
                            .copied()
                            .unwrap_or(Decimal::ZERO);
                        cells.push(self.format.cell(v));
                    }
                    table.add_row(Row::new(cells));
                }
            }
            if self.valuation.is_some() {
                let mut cells = vec![Cell::new(&format!("Total ({})", ty)).style_spec("b")];
                for col in &cols {
                    let total: Decimal = col
                        .iter()
                        .filter(|((a, _), _)| ctx.account_type(*a) == ty)
                        .map(|(_, v)| *v)
                        .sum();
                    cells.push(self.format.cell(total));
                }
                table.add_row(Row::new(cells));
            }
            table.add_empty_row();
        }
        if self.valuation.is_some() {
            let mut cells = vec![Cell::new("Total").style_spec("b")];
            for col in &cols {
                let total: Decimal = col.values().copied().sum();
                cells.push(self.format.cell(total));
            }
            table.add_row(Row::new(cells));
        }
        table
    }

    /// Accounts of one section, in tree order by default or flat
    /// alphabetical with --sort.
    fn section_accounts(&self, ty: AccountType, accounts: &HashSet<AccountId>) -> Vec<AccountId> {
        let ctx = &self.ctx;
        let mut section: Vec<AccountId> = accounts
            .iter()
            .copied()
            .filter(|a| ctx.account_type(*a) == ty)
            .collect();
        if self.sort_alphabetically {
            section.sort_by_key(|a| ctx.account_name(*a));
            return section;
        }
        let mut ordered = Vec::new();
        for root in ctx.roots() {
            if ctx.account_type(root) != ty {
                continue;
            }
            let mut stack = vec![root];
            while let Some(node) = stack.pop() {
                if section.contains(&node) {
                    ordered.push(node);
                }
                let mut children = ctx.children(node);
                children.reverse();
                stack.extend(children);
            }
        }
        // Mapped accounts can be shared roots; keep any stragglers.
        for a in section {
            if !ordered.contains(&a) {
                ordered.push(a);
            }
        }
        ordered
    }
}

/// Sink keeping each period snapshot day for the performance report.
#[derive(Clone, Default)]
pub struct PerformanceBuilder {
    pub days: Arc<Mutex<Vec<Day>>>,
}

#[async_trait]
impl Sink for PerformanceBuilder {
    fn name(&self) -> &'static str {
        "performance builder"
    }

    async fn run(&mut self, mut input: mpsc::Receiver<Day>) -> Result<(), ProcessError> {
        while let Some(day) = input.recv().await {
            self.days.lock().unwrap().push(day);
        }
        Ok(())
    }
}

/// Renders per-period portfolio values, flows and the period return, all
/// expressed in the valuation commodity.
pub struct PerformanceRenderer {
    pub format: Format,
}

impl PerformanceRenderer {
    pub fn render(&self, days: &[Day]) -> Table {
        let mut table = Table::new();
        table.add_row(row![
            "Date",
            "Opening",
            "Inflow",
            "Outflow",
            "Internal In",
            "Internal Out",
            "Closing",
            "Return"
        ]);
        table.add_empty_row();
        for day in days {
            let perf = match &day.performance {
                Some(p) => p,
                None => continue,
            };
            let sum = |m: &HashMap<CommodityId, Decimal>| -> Decimal {
                m.values().copied().sum()
            };
            let v0 = sum(&perf.v0);
            let v1 = sum(&perf.v1);
            let inflow = sum(&perf.inflow);
            let outflow = sum(&perf.outflow);
            let internal_in = sum(&perf.internal_inflow);
            let internal_out = sum(&perf.internal_outflow);
            table.add_row(Row::new(vec![
                Cell::new(&day.date.to_string()),
                self.format.cell(v0),
                self.format.cell(inflow),
                self.format.cell(outflow),
                self.format.cell(internal_in),
                self.format.cell(internal_out),
                self.format.cell(v1),
                self.return_cell(v0, v1, inflow, outflow, internal_in, internal_out),
            ]));
        }
        table
    }

    /// Inflows count as arriving at the period end, outflows as leaving
    /// at the period start, so a flow-only period returns exactly zero.
    fn return_cell(
        &self,
        v0: Decimal,
        v1: Decimal,
        inflow: Decimal,
        outflow: Decimal,
        internal_in: Decimal,
        internal_out: Decimal,
    ) -> Cell {
        let base = v0 + outflow + internal_out;
        if base.is_zero() {
            return Cell::new("").style_spec("r");
        }
        let ratio = (v1 - inflow - internal_in) / base;
        let pct = ((ratio - Decimal::ONE) * Decimal::from(100)).round_dp(2);
        let cell = Cell::new(&format!("{}%", pct)).style_spec("r");
        if self.format.color && pct.is_sign_negative() && !pct.is_zero() {
            cell.style_spec("rFr")
        } else {
            cell
        }
    }
}

/// Register rows keyed for stable, name-sorted output.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RegisterRow {
    date: Date,
    account: Arc<str>,
    description: Arc<str>,
    other: Arc<str>,
    commodity: Arc<str>,
}

/// An insert-add collection of register rows.
pub struct Register {
    ctx: Context,
    rows: BTreeMap<RegisterRow, Decimal>,
}

impl Register {
    pub fn new(ctx: Context) -> Register {
        Register {
            ctx,
            rows: BTreeMap::new(),
        }
    }

    pub fn to_table(&self, format: Format) -> Table {
        let mut table = Table::new();
        table.add_row(row!["Date", "Description", "Account", "Other", "Commodity", "Amount"]);
        table.add_empty_row();
        for (row, amount) in &self.rows {
            table.add_row(Row::new(vec![
                Cell::new(&row.date.to_string()),
                Cell::new(&row.description),
                Cell::new(&row.account),
                Cell::new(&row.other),
                Cell::new(&row.commodity),
                format.cell(*amount),
            ]));
        }
        table
    }
}

impl Collection for Register {
    fn insert(&mut self, key: Key, value: Decimal) {
        let row = RegisterRow {
            date: key.date,
            account: self.ctx.account_name(key.account),
            description: key.description,
            other: self.ctx.account_name(key.other),
            commodity: self.ctx.commodity_name(key.commodity),
        };
        let entry = self.rows.entry(row).or_insert(Decimal::ZERO);
        *entry += value;
    }
}

/// Sink running the query over every day and accumulating register rows.
pub struct RegisterBuilder {
    pub query: Query,
    pub register: Arc<Mutex<Register>>,
}

#[async_trait]
impl Sink for RegisterBuilder {
    fn name(&self) -> &'static str {
        "register builder"
    }

    async fn run(&mut self, mut input: mpsc::Receiver<Day>) -> Result<(), ProcessError> {
        while let Some(day) = input.recv().await {
            let mut register = self.register.lock().unwrap();
            self.query.execute(&day, &mut *register);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Posting, Range, Transaction};
    use time::macros::date;

    fn day_with_txn(ctx: &Context) -> Day {
        let cash = ctx.account("Assets:Cash").unwrap();
        let salary = ctx.account("Income:Salary").unwrap();
        let usd = ctx.commodity("USD").unwrap();
        let mut day = Day::new(date!(2023 - 01 - 02));
        day.transactions.push(Transaction {
            range: Range::default(),
            date: day.date,
            description: Arc::from("Pay"),
            tags: Vec::new(),
            postings: vec![Posting::new(salary, cash, usd, Decimal::from(100))],
            addons: Vec::new(),
        });
        day
    }

    #[test]
    fn test_query_splits_posting_sides() {
        let ctx = Context::new();
        let day = day_with_txn(&ctx);
        let mut register = Register::new(ctx.clone());
        let query = Query {
            filter: None,
            mapper: None,
            valuation: None,
        };
        query.execute(&day, &mut register);
        assert_eq!(register.rows.len(), 2);
        let amounts: Vec<Decimal> = register.rows.values().copied().collect();
        assert_eq!(amounts.iter().copied().sum::<Decimal>(), Decimal::ZERO);
    }

    #[test]
    fn test_query_filter_restricts_rows() {
        let ctx = Context::new();
        let day = day_with_txn(&ctx);
        let filter_ctx = ctx.clone();
        let query = Query {
            filter: Some(Box::new(move |k: &Key| {
                filter_ctx.account_name(k.account).starts_with("Assets")
            })),
            mapper: None,
            valuation: None,
        };
        let mut register = Register::new(ctx);
        query.execute(&day, &mut register);
        assert_eq!(register.rows.len(), 1);
    }

    #[test]
    fn test_performance_report_return() {
        let ctx = Context::new();
        let usd = ctx.commodity("USD").unwrap();
        let mut perf = crate::performance::Performance::default();
        perf.v0.insert(usd, Decimal::from(1000));
        perf.v1.insert(usd, Decimal::from(1150));
        perf.inflow.insert(usd, Decimal::from(100));
        let mut day = Day::new(date!(2023 - 03 - 31));
        day.performance = Some(perf);

        let renderer = PerformanceRenderer {
            format: Format::default(),
        };
        let table = renderer.render(&[day]);
        let row = table.get_row(2).unwrap();
        assert_eq!(row.get_cell(0).unwrap().get_content(), "2023-03-31");
        assert_eq!(row.get_cell(1).unwrap().get_content(), "1000");
        assert_eq!(row.get_cell(6).unwrap().get_content(), "1150");
        // (1150 - 100) / 1000, shown as a percentage change.
        assert_eq!(row.get_cell(7).unwrap().get_content(), "5.00%");
    }

    #[test]
    fn test_mapping_rule() {
        let ctx = Context::new();
        let rule = MappingRule::parse("1,^Assets").unwrap();
        let checking = ctx.account("Assets:Bank:Checking").unwrap();
        assert_eq!(
            rule.apply(&ctx, checking),
            Some(ctx.account("Assets").unwrap())
        );
        let income = ctx.account("Income:Salary").unwrap();
        assert_eq!(rule.apply(&ctx, income), None);
        assert!(MappingRule::parse("nonsense").is_err());
    }
}
