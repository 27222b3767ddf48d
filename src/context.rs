use std::{
    collections::HashMap,
    fmt::{self, Display},
    sync::{Arc, RwLock},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("invalid account name: {0}")]
    InvalidAccountName(String),
    #[error("invalid account type: {0}")]
    InvalidAccountType(String),
    #[error("invalid commodity name: {0}")]
    InvalidCommodityName(String),
}

/// Account class, derived from the first segment of the account name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccountType {
    Assets,
    Liabilities,
    Equity,
    Income,
    Expenses,
}

impl AccountType {
    fn from_segment(segment: &str) -> Option<AccountType> {
        match segment {
            "Assets" => Some(AccountType::Assets),
            "Liabilities" => Some(AccountType::Liabilities),
            "Equity" => Some(AccountType::Equity),
            "Income" => Some(AccountType::Income),
            "Expenses" => Some(AccountType::Expenses),
            _ => None,
        }
    }
}

impl Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountType::Assets => "Assets",
            AccountType::Liabilities => "Liabilities",
            AccountType::Equity => "Equity",
            AccountType::Income => "Income",
            AccountType::Expenses => "Expenses",
        };
        f.write_str(s)
    }
}

/// Interned account id. Identity equality is by id, not by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(u32);

/// Interned commodity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommodityId(u32);

struct AccountData {
    name: Arc<str>,
    ty: AccountType,
    parent: Option<AccountId>,
    children: Vec<AccountId>,
}

struct CommodityData {
    name: Arc<str>,
    is_currency: bool,
}

struct Inner {
    accounts: Vec<AccountData>,
    account_index: HashMap<Arc<str>, AccountId>,
    commodities: Vec<CommodityData>,
    commodity_index: HashMap<Arc<str>, CommodityId>,
}

/// Shared intern table for accounts and commodities, and the account tree.
///
/// Cloning is cheap; all clones refer to the same tables. The designated
/// accounts (equity root, valuation root, retained earnings, TBD) are
/// interned at construction time.
#[derive(Clone)]
pub struct Context {
    inner: Arc<RwLock<Inner>>,
    equity: AccountId,
    valuation: AccountId,
    retained_earnings: AccountId,
    tbd: AccountId,
}

impl Context {
    pub fn new() -> Context {
        let inner = Arc::new(RwLock::new(Inner {
            accounts: Vec::new(),
            account_index: HashMap::new(),
            commodities: Vec::new(),
            commodity_index: HashMap::new(),
        }));
        let ctx = Context {
            inner,
            equity: AccountId(0),
            valuation: AccountId(0),
            retained_earnings: AccountId(0),
            tbd: AccountId(0),
        };
        let equity = ctx.account("Equity").unwrap();
        let valuation = ctx.account("Equity:Valuation").unwrap();
        let retained_earnings = ctx.account("Equity:RetainedEarnings").unwrap();
        let tbd = ctx.account("TBD").unwrap();
        Context {
            equity,
            valuation,
            retained_earnings,
            tbd,
            ..ctx
        }
    }

    /// Interns an account by its fully qualified name, creating all
    /// ancestors along the way. The root segment determines the type.
    pub fn account(&self, name: &str) -> Result<AccountId, ContextError> {
        if name.is_empty() {
            return Err(ContextError::InvalidAccountName(name.to_string()));
        }
        let segments: Vec<&str> = name.split(':').collect();
        if segments
            .iter()
            .any(|s| s.is_empty() || !s.chars().all(|c| c.is_alphanumeric()))
        {
            return Err(ContextError::InvalidAccountName(name.to_string()));
        }
        let ty = match AccountType::from_segment(segments[0]) {
            Some(ty) => ty,
            // The TBD root holds postings awaiting account inference. It is
            // equity-class for lifecycle and reporting purposes.
            None if segments[0] == "TBD" => AccountType::Equity,
            None => return Err(ContextError::InvalidAccountType(segments[0].to_string())),
        };
        let mut inner = self.inner.write().unwrap();
        let mut parent: Option<AccountId> = None;
        let mut prefix = String::new();
        for segment in &segments {
            if !prefix.is_empty() {
                prefix.push(':');
            }
            prefix.push_str(segment);
            let id = match inner.account_index.get(prefix.as_str()) {
                Some(id) => *id,
                None => {
                    let id = AccountId(inner.accounts.len() as u32);
                    let name: Arc<str> = Arc::from(prefix.as_str());
                    inner.accounts.push(AccountData {
                        name: name.clone(),
                        ty,
                        parent,
                        children: Vec::new(),
                    });
                    inner.account_index.insert(name, id);
                    if let Some(p) = parent {
                        let pos = {
                            let parent_data = &inner.accounts[p.0 as usize];
                            let children = &parent_data.children;
                            children
                                .iter()
                                .position(|c| {
                                    inner.accounts[c.0 as usize].name.as_ref() > prefix.as_str()
                                })
                                .unwrap_or(children.len())
                        };
                        inner.accounts[p.0 as usize].children.insert(pos, id);
                    }
                    id
                }
            };
            parent = Some(id);
        }
        Ok(parent.unwrap())
    }

    /// Interns a commodity by name.
    pub fn commodity(&self, name: &str) -> Result<CommodityId, ContextError> {
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric()) {
            return Err(ContextError::InvalidCommodityName(name.to_string()));
        }
        let mut inner = self.inner.write().unwrap();
        if let Some(id) = inner.commodity_index.get(name) {
            return Ok(*id);
        }
        let id = CommodityId(inner.commodities.len() as u32);
        let name: Arc<str> = Arc::from(name);
        inner.commodities.push(CommodityData {
            name: name.clone(),
            is_currency: false,
        });
        inner.commodity_index.insert(name, id);
        Ok(id)
    }

    pub fn account_name(&self, id: AccountId) -> Arc<str> {
        self.inner.read().unwrap().accounts[id.0 as usize].name.clone()
    }

    pub fn account_type(&self, id: AccountId) -> AccountType {
        self.inner.read().unwrap().accounts[id.0 as usize].ty
    }

    /// Assets or liabilities.
    pub fn is_al(&self, id: AccountId) -> bool {
        matches!(
            self.account_type(id),
            AccountType::Assets | AccountType::Liabilities
        )
    }

    /// Income or expenses.
    pub fn is_ie(&self, id: AccountId) -> bool {
        matches!(
            self.account_type(id),
            AccountType::Income | AccountType::Expenses
        )
    }

    pub fn commodity_name(&self, id: CommodityId) -> Arc<str> {
        self.inner.read().unwrap().commodities[id.0 as usize].name.clone()
    }

    pub fn is_currency(&self, id: CommodityId) -> bool {
        self.inner.read().unwrap().commodities[id.0 as usize].is_currency
    }

    pub fn set_currency(&self, id: CommodityId) {
        self.inner.write().unwrap().commodities[id.0 as usize].is_currency = true;
    }

    pub fn parent(&self, id: AccountId) -> Option<AccountId> {
        self.inner.read().unwrap().accounts[id.0 as usize].parent
    }

    /// Children in name order.
    pub fn children(&self, id: AccountId) -> Vec<AccountId> {
        self.inner.read().unwrap().accounts[id.0 as usize].children.clone()
    }

    /// Root accounts in name order.
    pub fn roots(&self) -> Vec<AccountId> {
        let inner = self.inner.read().unwrap();
        let mut roots: Vec<AccountId> = inner
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.parent.is_none())
            .map(|(i, _)| AccountId(i as u32))
            .collect();
        roots.sort_by(|a, b| {
            inner.accounts[a.0 as usize]
                .name
                .cmp(&inner.accounts[b.0 as usize].name)
        });
        roots
    }

    /// The ancestor spanning the first `n` segments of the account name.
    /// Returns the account itself if it has fewer segments.
    pub fn ancestor(&self, id: AccountId, n: usize) -> AccountId {
        let name = self.account_name(id);
        let segments: Vec<&str> = name.split(':').collect();
        if n == 0 || n >= segments.len() {
            return id;
        }
        // Prefixes of an interned account are always interned.
        self.account(&segments[..n].join(":")).unwrap()
    }

    /// The designated valuation account for gains and losses on `account`.
    /// The mapping is stable and injective.
    pub fn valuation_account_for(&self, account: AccountId) -> AccountId {
        let name = self.account_name(account);
        self.account(&format!("Equity:Valuation:{}", name)).unwrap()
    }

    pub fn equity_account(&self) -> AccountId {
        self.equity
    }

    pub fn valuation_account(&self) -> AccountId {
        self.valuation
    }

    pub fn retained_earnings_account(&self) -> AccountId {
        self.retained_earnings
    }

    pub fn tbd_account(&self) -> AccountId {
        self.tbd
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("Context")
            .field("accounts", &inner.accounts.len())
            .field("commodities", &inner.commodities.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_interning() {
        let ctx = Context::new();
        let a = ctx.account("Assets:Bank:Checking").unwrap();
        let b = ctx.account("Assets:Bank:Checking").unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.account_name(a).as_ref(), "Assets:Bank:Checking");
        assert_eq!(ctx.account_type(a), AccountType::Assets);
        assert!(ctx.is_al(a));
        assert!(!ctx.is_ie(a));
    }

    #[test]
    fn test_account_tree() {
        let ctx = Context::new();
        let checking = ctx.account("Assets:Bank:Checking").unwrap();
        let savings = ctx.account("Assets:Bank:Savings").unwrap();
        let bank = ctx.account("Assets:Bank").unwrap();
        assert_eq!(ctx.parent(checking), Some(bank));
        assert_eq!(ctx.children(bank), vec![checking, savings]);
        assert_eq!(ctx.ancestor(checking, 2), bank);
        assert_eq!(ctx.ancestor(checking, 5), checking);
    }

    #[test]
    fn test_invalid_root_segment() {
        let ctx = Context::new();
        assert!(ctx.account("Banana:Split").is_err());
        assert!(ctx.account("Assets::Bank").is_err());
    }

    #[test]
    fn test_valuation_account() {
        let ctx = Context::new();
        let a = ctx.account("Assets:Foreign").unwrap();
        let v = ctx.valuation_account_for(a);
        assert_eq!(ctx.account_name(v).as_ref(), "Equity:Valuation:Assets:Foreign");
        assert_eq!(ctx.account_type(v), AccountType::Equity);
        let b = ctx.account("Assets:Foreign").unwrap();
        assert_eq!(ctx.valuation_account_for(b), v);
    }

    #[test]
    fn test_designated_accounts() {
        let ctx = Context::new();
        assert_eq!(ctx.account_name(ctx.equity_account()).as_ref(), "Equity");
        assert_eq!(
            ctx.account_name(ctx.valuation_account()).as_ref(),
            "Equity:Valuation"
        );
        assert_eq!(
            ctx.account_name(ctx.retained_earnings_account()).as_ref(),
            "Equity:RetainedEarnings"
        );
        assert_eq!(ctx.account_name(ctx.tbd_account()).as_ref(), "TBD");
        assert_eq!(ctx.account_type(ctx.tbd_account()), AccountType::Equity);
        assert!(!ctx.is_al(ctx.tbd_account()));
        assert!(!ctx.is_ie(ctx.tbd_account()));
    }

    #[test]
    fn test_commodities() {
        let ctx = Context::new();
        let usd = ctx.commodity("USD").unwrap();
        assert_eq!(usd, ctx.commodity("USD").unwrap());
        assert!(!ctx.is_currency(usd));
        ctx.set_currency(usd);
        assert!(ctx.is_currency(usd));
        assert!(ctx.commodity("US D").is_err());
    }
}
