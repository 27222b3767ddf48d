#![allow(clippy::redundant_closure_call)]

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use time::{Date, Month};

use crate::{
    ast::{
        Accrual, AddOn, Assertion, Close, Currency, Directive, Include, Lot, Open, Posting, Price,
        Range, Transaction, Value,
    },
    context::Context,
    period::Interval,
};

#[derive(Debug, Error)]
#[error("{path}:{line}:{column}: {message}")]
pub struct ParseError {
    pub path: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

fn span(path: &Arc<str>, start: usize, end: usize) -> Range {
    Range {
        path: path.clone(),
        start,
        end,
        line: 0,
        column: 0,
    }
}

peg::parser! {
    grammar journal(ctx: &Context, path: &Arc<str>) for str {

        rule _()
            = [' ' | '\t']

        rule eol()
            = "\r\n" / "\n"

        rule eol_or_eof()
            = eol() / ![_]

        rule comment()
            = ("*" / "#") (!eol() [_])*

        rule alpha_num()
            = ['a'..='z' | 'A'..='Z' | '0'..='9']

        rule date() -> Date
            = year:$(['0'..='9']*<4,4>) "-" month:$(['0'..='9']*<2,2>) "-" day:$(['0'..='9']*<2,2>) {?
                match (year.parse::<i32>(), month.parse::<u8>(), day.parse::<u8>()) {
                    (Ok(year), Ok(month), Ok(day)) => Month::try_from(month)
                        .or(Err("month"))
                        .and_then(|month| {
                            Date::from_calendar_date(year, month, day).or(Err("date"))
                        }),
                    _ => Err("date"),
                }
            }

        // e.g. '-0.53', '1200', "1'000.50"
        rule decimal() -> Decimal
            = n:$(("-" / "+")? ['0'..='9' | '\'']+ ("." ['0'..='9']+)?) {?
                let n = n.trim_start_matches('+').replace('\'', "");
                n.parse().or(Err("decimal"))
            }

        rule quoted() -> Arc<str>
            = "\"" s:$([^ '"' | '\n' | '\r']*) "\"" { Arc::from(s) }

        rule account() -> crate::context::AccountId
            = n:$(alpha_num()+ (":" alpha_num()+)*) {? ctx.account(n).or(Err("account")) }

        rule commodity() -> crate::context::CommodityId
            = n:$(alpha_num()+) {? ctx.commodity(n).or(Err("commodity")) }

        rule tag() -> Arc<str>
            = "#" t:$(['a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_']+) { Arc::from(t) }

        rule interval() -> Interval
            = "daily" { Interval::Daily }
            / "weekly" { Interval::Weekly }
            / "monthly" { Interval::Monthly }
            / "quarterly" { Interval::Quarterly }
            / "yearly" { Interval::Yearly }
            / "once" { Interval::Once }

        rule label() -> Arc<str>
            = quoted()
            / l:$(alpha_num()+) { Arc::from(l) }

        // e.g. '{ 101.99 USD, 2023-01-05 tranche1 }'
        rule lot() -> Lot
            = "{" _* price:decimal() _+ commodity:commodity() _* "," _* date:date()
              label:(_+ l:label() { l })? _* "}" {
                Lot { date, label, price, commodity }
            }

        rule posting() -> Posting
            = _+ credit:account() _+ debit:account() _+ amount:decimal() _+ commodity:commodity()
              lot:(_+ l:lot() { l })? _* eol_or_eof() {
                let mut p = Posting::new(credit, debit, commodity, amount);
                if let Some(lot) = lot {
                    p = p.with_lot(lot);
                }
                p
            }

        rule transaction_at(start: usize) -> Transaction
            = date:date() _+ description:quoted() tags:(_+ t:tag() { t })* _* eol()
              postings:posting()+ end:position!() {
                Transaction {
                    range: span(path, start, end),
                    date,
                    description,
                    tags,
                    postings,
                    addons: Vec::new(),
                }
            }

        rule transaction() -> Directive
            = start:position!() t:transaction_at(start) { Directive::Transaction(t) }

        rule accrued_transaction() -> Directive
            = start:position!() "@accrue" _+ interval:interval() _+ t0:date() _+ t1:date()
              _+ account:account() _* eol() t:transaction_at(start) {?
                if t.postings.len() == 1 {
                    let mut t = t;
                    t.addons.push(AddOn::Accrual(Accrual {
                        range: t.range.clone(),
                        interval,
                        t0,
                        t1,
                        account,
                    }));
                    Ok(Directive::Transaction(t))
                } else {
                    Err("accrued transaction with a single posting")
                }
            }

        rule open() -> Directive
            = start:position!() date:date() _+ "open" _+ account:account() _* eol_or_eof()
              end:position!() {
                Directive::Open(Open { range: span(path, start, end), date, account })
            }

        rule close() -> Directive
            = start:position!() date:date() _+ "close" _+ account:account() _* eol_or_eof()
              end:position!() {
                Directive::Close(Close { range: span(path, start, end), date, account })
            }

        rule price() -> Directive
            = start:position!() date:date() _+ "price" _+ commodity:commodity() _+ price:decimal()
              _+ target:commodity() _* eol_or_eof() end:position!() {
                Directive::Price(Price { range: span(path, start, end), date, commodity, price, target })
            }

        rule assertion() -> Directive
            = start:position!() date:date() _+ "balance" _+ account:account() _+ amount:decimal()
              _+ commodity:commodity() _* eol_or_eof() end:position!() {
                Directive::Assertion(Assertion { range: span(path, start, end), date, account, amount, commodity })
            }

        rule value() -> Directive
            = start:position!() date:date() _+ "value" _+ account:account() _+ amount:decimal()
              _+ commodity:commodity() _* eol_or_eof() end:position!() {
                Directive::Value(Value { range: span(path, start, end), date, account, amount, commodity })
            }

        rule currency() -> Directive
            = start:position!() date:date() _+ "currency" _+ commodity:commodity() _* eol_or_eof()
              end:position!() {
                Directive::Currency(Currency { range: span(path, start, end), date, commodity })
            }

        rule include() -> Directive
            = start:position!() "include" _+ p:quoted() _* eol_or_eof() end:position!() {
                Directive::Include(Include { range: span(path, start, end), path: p })
            }

        rule directive() -> Directive
            = open() / close() / price() / assertion() / value() / currency() / include()
            / accrued_transaction() / transaction()

        rule blank()
            = _* comment() eol_or_eof()
            / _* eol()
            / _+ ![_]

        rule item() -> Option<Directive>
            = d:directive() { Some(d) }
            / blank() { None }

        pub rule file() -> Vec<Directive>
            = items:item()* ![_] { items.into_iter().flatten().collect() }
    }
}

/// Parses one journal file into its directive sequence. Source ranges
/// carry byte offsets and the line/column of the directive start.
pub fn parse(ctx: &Context, path: &str, text: &str) -> Result<Vec<Directive>, ParseError> {
    let path: Arc<str> = Arc::from(path);
    let mut directives = journal::file(text, ctx, &path).map_err(|e| ParseError {
        path: path.to_string(),
        line: e.location.line as u32,
        column: e.location.column as u32,
        message: format!("expected {}", e.expected),
    })?;

    // Line starts, for cheap offset -> line/column resolution.
    let mut line_starts = vec![0usize];
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            line_starts.push(i + 1);
        }
    }
    for directive in &mut directives {
        let start = directive.range().start;
        let line = match line_starts.binary_search(&start) {
            Ok(l) => l,
            Err(l) => l - 1,
        };
        let column = start - line_starts[line] + 1;
        set_position(directive, line as u32 + 1, column as u32);
    }
    Ok(directives)
}

fn set_position(directive: &mut Directive, line: u32, column: u32) {
    let range = match directive {
        Directive::Open(d) => &mut d.range,
        Directive::Close(d) => &mut d.range,
        Directive::Price(d) => &mut d.range,
        Directive::Transaction(d) => &mut d.range,
        Directive::Assertion(d) => &mut d.range,
        Directive::Value(d) => &mut d.range,
        Directive::Include(d) => &mut d.range,
        Directive::Currency(d) => &mut d.range,
    };
    range.line = line;
    range.column = column;
    if let Directive::Transaction(t) = directive {
        for addon in &mut t.addons {
            let AddOn::Accrual(a) = addon;
            a.range.line = line;
            a.range.column = column;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn parse_one(ctx: &Context, text: &str) -> Directive {
        let mut ds = parse(ctx, "test.journal", text).unwrap();
        assert_eq!(ds.len(), 1, "expected one directive in {:?}", text);
        ds.remove(0)
    }

    #[test]
    fn test_parse_open_close() {
        let ctx = Context::new();
        match parse_one(&ctx, "2023-01-01 open Assets:Cash\n") {
            Directive::Open(o) => {
                assert_eq!(o.date, date!(2023 - 01 - 01));
                assert_eq!(ctx.account_name(o.account).as_ref(), "Assets:Cash");
                assert_eq!(o.range.line, 1);
                assert_eq!(o.range.column, 1);
            }
            d => panic!("expected open, got {:?}", d),
        }
        match parse_one(&ctx, "2023-06-30 close Assets:Cash\n") {
            Directive::Close(c) => assert_eq!(c.date, date!(2023 - 06 - 30)),
            d => panic!("expected close, got {:?}", d),
        }
    }

    #[test]
    fn test_parse_transaction() {
        let ctx = Context::new();
        let text = "2023-01-02 \"Pay\" #salary\n  Income:Salary Assets:Cash 100 USD\n";
        match parse_one(&ctx, text) {
            Directive::Transaction(t) => {
                assert_eq!(t.description.as_ref(), "Pay");
                assert_eq!(t.tags, vec![Arc::<str>::from("salary")]);
                assert_eq!(t.postings.len(), 1);
                let p = &t.postings[0];
                assert_eq!(ctx.account_name(p.credit).as_ref(), "Income:Salary");
                assert_eq!(ctx.account_name(p.debit).as_ref(), "Assets:Cash");
                assert_eq!(p.amount, Decimal::from(100));
                assert_eq!(t.range.start, 0);
                assert_eq!(t.range.end, text.len());
            }
            d => panic!("expected transaction, got {:?}", d),
        }
    }

    #[test]
    fn test_parse_price_and_assertion() {
        let ctx = Context::new();
        match parse_one(&ctx, "2023-01-02 price EUR 1.1 USD\n") {
            Directive::Price(p) => {
                assert_eq!(p.price, "1.1".parse().unwrap());
                assert_eq!(ctx.commodity_name(p.commodity).as_ref(), "EUR");
                assert_eq!(ctx.commodity_name(p.target).as_ref(), "USD");
            }
            d => panic!("expected price, got {:?}", d),
        }
        match parse_one(&ctx, "2023-01-03 balance Assets:Cash 1'000.50 USD\n") {
            Directive::Assertion(a) => assert_eq!(a.amount, "1000.50".parse().unwrap()),
            d => panic!("expected assertion, got {:?}", d),
        }
    }

    #[test]
    fn test_parse_accrual_addon() {
        let ctx = Context::new();
        let text = "@accrue monthly 2023-01-01 2023-12-31 Liabilities:Accrual\n\
                    2023-01-01 \"Rent\"\n  Assets:Bank Expenses:Rent 1200 USD\n";
        match parse_one(&ctx, text) {
            Directive::Transaction(t) => {
                assert_eq!(t.addons.len(), 1);
                let AddOn::Accrual(a) = &t.addons[0];
                assert_eq!(a.interval, Interval::Monthly);
                assert_eq!(a.t0, date!(2023 - 01 - 01));
                assert_eq!(a.t1, date!(2023 - 12 - 31));
                assert_eq!(ctx.account_name(a.account).as_ref(), "Liabilities:Accrual");
            }
            d => panic!("expected transaction, got {:?}", d),
        }
    }

    #[test]
    fn test_parse_comments_and_blanks() {
        let ctx = Context::new();
        let text = "* a comment\n\n2023-01-01 open Assets:Cash\n\n# another\n2023-01-01 open Income:Salary\n";
        let ds = parse(&ctx, "test.journal", text).unwrap();
        assert_eq!(ds.len(), 2);
    }

    #[test]
    fn test_parse_lot() {
        let ctx = Context::new();
        let text = "2023-01-02 \"Buy\"\n  Assets:Cash Assets:Shares 10 AAPL { 101.99 USD, 2023-01-02 tranche1 }\n";
        match parse_one(&ctx, text) {
            Directive::Transaction(t) => {
                let lot = t.postings[0].lot.as_ref().unwrap();
                assert_eq!(lot.price, "101.99".parse().unwrap());
                assert_eq!(lot.label.as_deref(), Some("tranche1"));
            }
            d => panic!("expected transaction, got {:?}", d),
        }
    }

    #[test]
    fn test_parse_error_position() {
        let ctx = Context::new();
        let err = parse(&ctx, "bad.journal", "2023-01-01 open Assets:Cash\nnonsense\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.to_string().starts_with("bad.journal:2:"));
    }

    #[test]
    fn test_parse_include() {
        let ctx = Context::new();
        match parse_one(&ctx, "include \"sub/extra.journal\"\n") {
            Directive::Include(i) => assert_eq!(i.path.as_ref(), "sub/extra.journal"),
            d => panic!("expected include, got {:?}", d),
        }
    }
}
