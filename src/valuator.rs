use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    amounts::Positions,
    ast::{Posting, Range, Transaction},
    context::{CommodityId, Context},
    journal::Day,
    pipeline::{push, ProcessError, Stage},
    prices::NormalizedPrices,
};

/// Valuates every posting in the day's normalized prices and synthesises
/// gain/loss transactions where position valuations drift from amounts.
/// A no-op without a target valuation commodity.
pub struct Valuator {
    pub ctx: Context,
    pub valuation: Option<CommodityId>,
}

impl Valuator {
    fn valuate_transactions(
        &self,
        valuation: CommodityId,
        normalized: &NormalizedPrices,
        values: &mut Positions,
        day: &mut Day,
    ) -> Result<(), ProcessError> {
        for t in &mut day.transactions {
            for p in &mut t.postings {
                p.value = if p.commodity == valuation {
                    p.amount
                } else {
                    normalized.valuate(p.commodity, p.amount)?
                };
                values.book(p.credit, p.debit, p.commodity, p.value);
            }
        }
        Ok(())
    }

    /// Compares the valuation of each asset/liability position with its
    /// accumulated value and books the difference as a gain transaction.
    fn valuate_gains(
        &self,
        valuation: CommodityId,
        normalized: &NormalizedPrices,
        values: &mut Positions,
        day: &mut Day,
    ) -> Result<(), ProcessError> {
        let mut positions = day.amounts.positions();
        positions.sort_by_key(|(a, c)| (self.ctx.account_name(*a), self.ctx.commodity_name(*c)));
        for (account, commodity) in positions {
            if commodity == valuation || !self.ctx.is_al(account) {
                continue;
            }
            let amount = day.amounts.amount(account, commodity);
            let target = normalized.valuate(commodity, amount)?;
            let gain = target - values.amount(account, commodity);
            if gain.is_zero() {
                continue;
            }
            let credit = self.ctx.valuation_account_for(account);
            let mut posting = Posting::new(credit, account, commodity, rust_decimal::Decimal::ZERO)
                .with_targets(vec![commodity]);
            posting.value = gain;
            day.transactions.push(Transaction {
                range: Range::default(),
                date: day.date,
                description: Arc::from(format!(
                    "Adjust value of {} in account {}",
                    self.ctx.commodity_name(commodity),
                    self.ctx.account_name(account)
                )),
                tags: Vec::new(),
                postings: vec![posting],
                addons: Vec::new(),
            });
            values.add(account, commodity, gain);
            values.add(credit, commodity, -gain);
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for Valuator {
    fn name(&self) -> &'static str {
        "valuator"
    }

    async fn run(
        &mut self,
        mut input: mpsc::Receiver<Day>,
        out: mpsc::Sender<Day>,
    ) -> Result<(), ProcessError> {
        let valuation = match self.valuation {
            Some(v) => v,
            None => {
                while let Some(day) = input.recv().await {
                    push(&out, day).await?;
                }
                return Ok(());
            }
        };
        let mut values = Positions::new();
        while let Some(mut day) = input.recv().await {
            let normalized = day
                .normalized
                .clone()
                .unwrap_or_else(|| Arc::new(NormalizedPrices::empty(self.ctx.clone(), valuation)));
            self.valuate_transactions(valuation, &normalized, &mut values, &mut day)?;
            self.valuate_gains(valuation, &normalized, &mut values, &mut day)?;
            day.value = values.clone();
            push(&out, day).await?;
        }
        Ok(())
    }
}
