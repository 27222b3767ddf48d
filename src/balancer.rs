use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    amounts::Positions,
    ast::{Directive, Posting, Range, Transaction},
    context::{AccountId, AccountType, Context},
    journal::Day,
    pipeline::{push, ProcessError, Stage},
    printer,
};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{range}: account {account} is already open\n{directive}")]
    AccountAlreadyOpen {
        range: Range,
        account: Arc<str>,
        directive: String,
    },
    #[error("{range}: account {account} is not open\n{directive}")]
    AccountNotOpen {
        range: Range,
        account: Arc<str>,
        directive: String,
    },
    #[error("{range}: account {account} has nonzero position: {amount} {commodity}\n{directive}")]
    NonzeroClose {
        range: Range,
        account: Arc<str>,
        commodity: Arc<str>,
        amount: Decimal,
        directive: String,
    },
}

#[derive(Debug, Error)]
#[error("{range}: account {account} has position {actual} {commodity}, expected {expected}\n{directive}")]
pub struct AssertionFailed {
    pub range: Range,
    pub account: Arc<str>,
    pub commodity: Arc<str>,
    pub expected: Decimal,
    pub actual: Decimal,
    pub directive: String,
}

/// Balances the journal: enforces account lifecycle and posting legality,
/// maintains running position amounts, synthesises value-directive
/// adjustments, verifies assertions and clears closed accounts.
pub struct Balancer {
    pub ctx: Context,
}

struct State {
    open: HashSet<AccountId>,
    amounts: Positions,
}

impl Balancer {
    fn is_open(&self, state: &State, account: AccountId) -> bool {
        // Equity-class accounts are implicitly open for membership checks.
        state.open.contains(&account) || self.ctx.account_type(account) == AccountType::Equity
    }

    fn process_openings(&self, state: &mut State, day: &Day) -> Result<(), LifecycleError> {
        for o in &day.openings {
            if !state.open.insert(o.account) {
                return Err(LifecycleError::AccountAlreadyOpen {
                    range: o.range.clone(),
                    account: self.ctx.account_name(o.account),
                    directive: printer::render(&self.ctx, &Directive::Open(o.clone())),
                });
            }
        }
        Ok(())
    }

    fn process_transactions(&self, state: &mut State, day: &Day) -> Result<(), LifecycleError> {
        for t in &day.transactions {
            for p in &t.postings {
                for side in [p.credit, p.debit] {
                    if !self.is_open(state, side) {
                        return Err(LifecycleError::AccountNotOpen {
                            range: t.range.clone(),
                            account: self.ctx.account_name(side),
                            directive: printer::render(&self.ctx, &Directive::Transaction(t.clone())),
                        });
                    }
                }
                state.amounts.book(p.credit, p.debit, p.commodity, p.amount);
            }
        }
        Ok(())
    }

    fn process_values(&self, state: &mut State, day: &mut Day) -> Result<(), LifecycleError> {
        for v in &day.values {
            if !self.is_open(state, v.account) {
                return Err(LifecycleError::AccountNotOpen {
                    range: v.range.clone(),
                    account: self.ctx.account_name(v.account),
                    directive: printer::render(&self.ctx, &Directive::Value(v.clone())),
                });
            }
            let delta = v.amount - state.amounts.amount(v.account, v.commodity);
            let posting = Posting::new(
                self.ctx.valuation_account_for(v.account),
                v.account,
                v.commodity,
                delta,
            )
            .with_targets(vec![v.commodity]);
            state
                .amounts
                .book(posting.credit, posting.debit, posting.commodity, posting.amount);
            day.transactions.push(Transaction {
                range: v.range.clone(),
                date: v.date,
                description: Arc::from(format!(
                    "Valuation adjustment for {} in {}",
                    self.ctx.commodity_name(v.commodity),
                    self.ctx.account_name(v.account)
                )),
                tags: Vec::new(),
                postings: vec![posting],
                addons: Vec::new(),
            });
        }
        if !day.values.is_empty() {
            let ctx = self.ctx.clone();
            day.transactions.sort_by(|a, b| a.compare(b, &ctx));
        }
        Ok(())
    }

    fn process_assertions(&self, state: &State, day: &Day) -> Result<(), ProcessError> {
        for a in &day.assertions {
            if !self.is_open(state, a.account) {
                return Err(LifecycleError::AccountNotOpen {
                    range: a.range.clone(),
                    account: self.ctx.account_name(a.account),
                    directive: printer::render(&self.ctx, &Directive::Assertion(a.clone())),
                }
                .into());
            }
            let actual = state.amounts.get(&(a.account, a.commodity));
            if actual != Some(a.amount) {
                return Err(AssertionFailed {
                    range: a.range.clone(),
                    account: self.ctx.account_name(a.account),
                    commodity: self.ctx.commodity_name(a.commodity),
                    expected: a.amount,
                    actual: actual.unwrap_or(Decimal::ZERO),
                    directive: printer::render(&self.ctx, &Directive::Assertion(a.clone())),
                }
                .into());
            }
        }
        Ok(())
    }

    fn process_closings(&self, state: &mut State, day: &Day) -> Result<(), LifecycleError> {
        for c in &day.closings {
            if !self.is_open(state, c.account) {
                return Err(LifecycleError::AccountNotOpen {
                    range: c.range.clone(),
                    account: self.ctx.account_name(c.account),
                    directive: printer::render(&self.ctx, &Directive::Close(c.clone())),
                });
            }
            for position in state.amounts.positions() {
                if position.0 != c.account {
                    continue;
                }
                let amount = state.amounts.get(&position).unwrap_or(Decimal::ZERO);
                if !amount.is_zero() {
                    return Err(LifecycleError::NonzeroClose {
                        range: c.range.clone(),
                        account: self.ctx.account_name(c.account),
                        commodity: self.ctx.commodity_name(position.1),
                        amount,
                        directive: printer::render(&self.ctx, &Directive::Close(c.clone())),
                    });
                }
                state.amounts.remove(&position);
            }
            state.open.remove(&c.account);
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for Balancer {
    fn name(&self) -> &'static str {
        "balancer"
    }

    async fn run(
        &mut self,
        mut input: mpsc::Receiver<Day>,
        out: mpsc::Sender<Day>,
    ) -> Result<(), ProcessError> {
        let mut state = State {
            open: HashSet::new(),
            amounts: Positions::new(),
        };
        while let Some(mut day) = input.recv().await {
            self.process_openings(&mut state, &day)?;
            self.process_transactions(&mut state, &day)?;
            self.process_values(&mut state, &mut day)?;
            self.process_assertions(&state, &day)?;
            self.process_closings(&mut state, &day)?;
            day.amounts = state.amounts.clone();
            push(&out, day).await?;
        }
        Ok(())
    }
}
