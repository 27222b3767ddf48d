use std::collections::{hash_map, HashMap};

use rust_decimal::Decimal;

use crate::context::{AccountId, CommodityId};

/// A position key: one account holding one commodity.
pub type Position = (AccountId, CommodityId);

/// Signed decimal amounts per position. The balancer maintains one of
/// these for amounts, the valuator another for values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Positions(HashMap<Position, Decimal>);

impl Positions {
    pub fn new() -> Positions {
        Positions(HashMap::new())
    }

    pub fn add(&mut self, account: AccountId, commodity: CommodityId, amount: Decimal) {
        let entry = self.0.entry((account, commodity)).or_insert(Decimal::ZERO);
        *entry += amount;
    }

    /// Books an amount against a credit/debit pair.
    pub fn book(
        &mut self,
        credit: AccountId,
        debit: AccountId,
        commodity: CommodityId,
        amount: Decimal,
    ) {
        self.add(credit, commodity, -amount);
        self.add(debit, commodity, amount);
    }

    pub fn amount(&self, account: AccountId, commodity: CommodityId) -> Decimal {
        self.0.get(&(account, commodity)).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn get(&self, position: &Position) -> Option<Decimal> {
        self.0.get(position).copied()
    }

    pub fn remove(&mut self, position: &Position) {
        self.0.remove(position);
    }

    pub fn iter(&self) -> hash_map::Iter<'_, Position, Decimal> {
        self.0.iter()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.0.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Pointwise difference `self - other`; absent keys count as zero.
    pub fn diff(&self, other: &Positions) -> Positions {
        let mut res = self.clone();
        for (pos, amount) in other.iter() {
            let entry = res.0.entry(*pos).or_insert(Decimal::ZERO);
            *entry -= *amount;
        }
        res
    }

    /// Pointwise sum.
    pub fn plus(&self, other: &Positions) -> Positions {
        let mut res = self.clone();
        for (pos, amount) in other.iter() {
            let entry = res.0.entry(*pos).or_insert(Decimal::ZERO);
            *entry += *amount;
        }
        res
    }
}

impl FromIterator<(Position, Decimal)> for Positions {
    fn from_iter<I: IntoIterator<Item = (Position, Decimal)>>(iter: I) -> Positions {
        Positions(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn test_book_and_diff() {
        let ctx = Context::new();
        let cash = ctx.account("Assets:Cash").unwrap();
        let salary = ctx.account("Income:Salary").unwrap();
        let usd = ctx.commodity("USD").unwrap();

        let mut p = Positions::new();
        p.book(salary, cash, usd, Decimal::from(100));
        assert_eq!(p.amount(cash, usd), Decimal::from(100));
        assert_eq!(p.amount(salary, usd), Decimal::from(-100));

        let mut q = p.clone();
        q.book(salary, cash, usd, Decimal::from(50));
        let d = q.diff(&p);
        assert_eq!(d.amount(cash, usd), Decimal::from(50));
        assert_eq!(d.amount(salary, usd), Decimal::from(-50));
        assert_eq!(p.plus(&d), q);
    }
}
