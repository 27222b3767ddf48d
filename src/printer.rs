use std::fmt::Write;

use crate::{
    ast::{AddOn, Directive, Lot, Posting, Transaction},
    context::Context,
};

/// Renders directives in canonical journal syntax. The rendering of any
/// directive ends with a newline.
pub struct Printer<'a> {
    ctx: &'a Context,
    padding: usize,
}

impl<'a> Printer<'a> {
    pub fn new(ctx: &'a Context) -> Printer<'a> {
        Printer { ctx, padding: 0 }
    }

    /// Pads credit and debit accounts to the given width, aligning the
    /// amount columns of consecutive transactions.
    pub fn with_padding(ctx: &'a Context, padding: usize) -> Printer<'a> {
        Printer { ctx, padding }
    }

    pub fn directive(&self, directive: &Directive) -> String {
        let mut out = String::new();
        match directive {
            Directive::Open(o) => {
                let _ = writeln!(out, "{} open {}", o.date, self.ctx.account_name(o.account));
            }
            Directive::Close(c) => {
                let _ = writeln!(out, "{} close {}", c.date, self.ctx.account_name(c.account));
            }
            Directive::Price(p) => {
                let _ = writeln!(
                    out,
                    "{} price {} {} {}",
                    p.date,
                    self.ctx.commodity_name(p.commodity),
                    p.price,
                    self.ctx.commodity_name(p.target)
                );
            }
            Directive::Assertion(a) => {
                let _ = writeln!(
                    out,
                    "{} balance {} {} {}",
                    a.date,
                    self.ctx.account_name(a.account),
                    a.amount,
                    self.ctx.commodity_name(a.commodity)
                );
            }
            Directive::Value(v) => {
                let _ = writeln!(
                    out,
                    "{} value {} {} {}",
                    v.date,
                    self.ctx.account_name(v.account),
                    v.amount,
                    self.ctx.commodity_name(v.commodity)
                );
            }
            Directive::Currency(c) => {
                let _ = writeln!(out, "{} currency {}", c.date, self.ctx.commodity_name(c.commodity));
            }
            Directive::Include(i) => {
                let _ = writeln!(out, "include \"{}\"", i.path);
            }
            Directive::Transaction(t) => self.transaction(t, &mut out),
        }
        out
    }

    fn transaction(&self, t: &Transaction, out: &mut String) {
        for addon in &t.addons {
            let AddOn::Accrual(a) = addon;
            let _ = writeln!(
                out,
                "@accrue {} {} {} {}",
                a.interval,
                a.t0,
                a.t1,
                self.ctx.account_name(a.account)
            );
        }
        let _ = write!(out, "{} \"{}\"", t.date, t.description);
        for tag in &t.tags {
            let _ = write!(out, " #{}", tag);
        }
        out.push('\n');
        for p in &t.postings {
            self.posting(p, out);
        }
    }

    fn posting(&self, p: &Posting, out: &mut String) {
        let _ = write!(
            out,
            "  {:<pad$} {:<pad$} {:>10} {}",
            self.ctx.account_name(p.credit),
            self.ctx.account_name(p.debit),
            p.amount.to_string(),
            self.ctx.commodity_name(p.commodity),
            pad = self.padding,
        );
        if let Some(lot) = &p.lot {
            self.lot(lot, out);
        }
        out.push('\n');
    }

    fn lot(&self, lot: &Lot, out: &mut String) {
        let _ = write!(
            out,
            " {{ {} {}, {}",
            lot.price,
            self.ctx.commodity_name(lot.commodity),
            lot.date
        );
        if let Some(label) = &lot.label {
            let _ = write!(out, " {}", label);
        }
        out.push_str(" }");
    }
}

/// One-off rendering without alignment, used in error messages.
pub fn render(ctx: &Context, directive: &Directive) -> String {
    Printer::new(ctx).directive(directive)
}

/// The widest credit or debit account name across all transactions, used
/// to align a whole file's postings.
pub fn max_account_width(ctx: &Context, directives: &[Directive]) -> usize {
    directives
        .iter()
        .filter_map(|d| match d {
            Directive::Transaction(t) => t
                .postings
                .iter()
                .map(|p| {
                    ctx.account_name(p.credit)
                        .len()
                        .max(ctx.account_name(p.debit).len())
                })
                .max(),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}
