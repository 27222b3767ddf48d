use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    context::{CommodityId, Context},
    journal::Day,
    pipeline::{push, ProcessError, Stage},
};

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("no price found for commodity {commodity} in {target}")]
    NoPrice { commodity: Arc<str>, target: Arc<str> },
}

/// Directed price graph. Every inserted edge also stores its inverse at
/// the reciprocal weight.
pub struct Prices {
    ctx: Context,
    prices: HashMap<CommodityId, HashMap<CommodityId, Decimal>>,
}

impl Prices {
    pub fn new(ctx: Context) -> Prices {
        Prices {
            ctx,
            prices: HashMap::new(),
        }
    }

    pub fn insert(&mut self, commodity: CommodityId, price: Decimal, target: CommodityId) {
        self.prices
            .entry(commodity)
            .or_default()
            .insert(target, price);
        self.prices
            .entry(target)
            .or_default()
            .insert(commodity, Decimal::ONE / price);
    }

    /// Normalizes all reachable commodities to the target, composing
    /// weights along the minimum-hop path. Neighbours are visited in
    /// commodity-name order, which makes tie-breaks reproducible.
    pub fn normalize(&self, target: CommodityId) -> NormalizedPrices {
        let mut prices = HashMap::new();
        prices.insert(target, Decimal::ONE);
        let mut queue = VecDeque::from([target]);
        while let Some(node) = queue.pop_front() {
            let mut neighbours: Vec<CommodityId> = match self.prices.get(&node) {
                Some(m) => m.keys().copied().collect(),
                None => continue,
            };
            neighbours.sort_by_key(|c| self.ctx.commodity_name(*c));
            let node_price = prices[&node];
            for c in neighbours {
                if prices.contains_key(&c) {
                    continue;
                }
                let weight = self.prices[&c][&node];
                prices.insert(c, weight * node_price);
                queue.push_back(c);
            }
        }
        NormalizedPrices {
            ctx: self.ctx.clone(),
            target,
            prices,
        }
    }
}

/// Per-commodity exchange rates into one target commodity, frozen as of
/// some day. Unreachable commodities are absent.
#[derive(Debug, Clone)]
pub struct NormalizedPrices {
    ctx: Context,
    target: CommodityId,
    prices: HashMap<CommodityId, Decimal>,
}

impl NormalizedPrices {
    pub fn empty(ctx: Context, target: CommodityId) -> NormalizedPrices {
        let mut prices = HashMap::new();
        prices.insert(target, Decimal::ONE);
        NormalizedPrices { ctx, target, prices }
    }

    pub fn price(&self, commodity: CommodityId) -> Option<Decimal> {
        self.prices.get(&commodity).copied()
    }

    /// The value of `amount` units of `commodity` in the target commodity.
    pub fn valuate(&self, commodity: CommodityId, amount: Decimal) -> Result<Decimal, PriceError> {
        if commodity == self.target {
            return Ok(amount);
        }
        match self.prices.get(&commodity) {
            Some(price) => Ok(amount * price),
            None => Err(PriceError::NoPrice {
                commodity: self.ctx.commodity_name(commodity),
                target: self.ctx.commodity_name(self.target),
            }),
        }
    }
}

/// Folds each day's price directives into a running price book and
/// attaches the day's normalized view. Days without price directives
/// share the previous (frozen) normalization.
pub struct PriceUpdater {
    pub ctx: Context,
    pub valuation: Option<CommodityId>,
}

#[async_trait]
impl Stage for PriceUpdater {
    fn name(&self) -> &'static str {
        "price updater"
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
        let mut book = Prices::new(self.ctx.clone());
        let mut previous = Arc::new(NormalizedPrices::empty(self.ctx.clone(), valuation));
        while let Some(mut day) = input.recv().await {
            if !day.prices.is_empty() {
                for p in &day.prices {
                    book.insert(p.commodity, p.price, p.target);
                }
                previous = Arc::new(book.normalize(valuation));
            }
            day.normalized = Some(previous.clone());
            push(&out, day).await?;
        }
        Ok(())
    }
}
