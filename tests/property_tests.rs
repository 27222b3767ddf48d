use proptest::prelude::*;
use rust_decimal::Decimal;
use time::{Date, Duration, Month};

use daybook::{
    amounts::Positions,
    ast::{Accrual, Posting, Range, Transaction},
    context::Context,
    period::{periods, Interval},
    prices::Prices,
};

fn arb_date() -> impl Strategy<Value = Date> {
    (2000i32..2030, 1u8..=12, 1u8..=28).prop_map(|(y, m, d)| {
        Date::from_calendar_date(y, Month::try_from(m).unwrap(), d).unwrap()
    })
}

fn arb_interval() -> impl Strategy<Value = Interval> {
    prop_oneof![
        Just(Interval::Daily),
        Just(Interval::Weekly),
        Just(Interval::Monthly),
        Just(Interval::Quarterly),
        Just(Interval::Yearly),
    ]
}

proptest! {
    #[test]
    fn periods_tile_the_window(t0 in arb_date(), days in 0i64..700, interval in arb_interval()) {
        let t1 = t0 + Duration::days(days);
        let ps = periods(t0, t1, interval);
        prop_assert!(!ps.is_empty());
        prop_assert_eq!(ps[0].start, t0);
        prop_assert_eq!(ps[ps.len() - 1].end, t1);
        for p in &ps {
            prop_assert!(p.start <= p.end);
        }
        for w in ps.windows(2) {
            prop_assert_eq!(w[0].end.next_day().unwrap(), w[1].start);
        }
    }

    #[test]
    fn accrual_expansion_conserves_amount(
        cents in 1i64..10_000_000,
        months in 1u8..24,
    ) {
        let ctx = Context::new();
        let amount = Decimal::new(cents, 2);
        let t0 = Date::from_calendar_date(2023, Month::January, 1).unwrap();
        let offset = months as i32 - 1;
        let year = 2023 + offset / 12;
        let month = Month::try_from((offset % 12 + 1) as u8).unwrap();
        let t1 = daybook::period::end_of(
            Date::from_calendar_date(year, month, 1).unwrap(),
            Interval::Monthly,
        );

        let accrual = Accrual {
            range: Range::default(),
            interval: Interval::Monthly,
            t0,
            t1,
            account: ctx.account("Liabilities:Accrual").unwrap(),
        };
        let txn = Transaction {
            range: Range::default(),
            date: t0,
            description: "spread".into(),
            tags: Vec::new(),
            postings: vec![Posting::new(
                ctx.account("Assets:Bank").unwrap(),
                ctx.account("Expenses:Fees").unwrap(),
                ctx.commodity("USD").unwrap(),
                amount,
            )],
            addons: Vec::new(),
        };
        let expanded = accrual.expand(&ctx, &txn);
        // All but the trailing original-dated transaction are period shares.
        let shares = &expanded[..expanded.len() - 1];
        let total: Decimal = shares.iter().map(|t| t.postings[0].amount).sum();
        prop_assert_eq!(total, amount);
        // Every share but the first is identical.
        for w in shares.windows(2).skip(1) {
            prop_assert_eq!(w[0].postings[0].amount, w[1].postings[0].amount);
        }
    }

    #[test]
    fn normalization_is_idempotent(
        weights in proptest::collection::vec(1i64..100_000, 1..8),
    ) {
        let ctx = Context::new();
        let target = ctx.commodity("TGT").unwrap();
        let mut prices = Prices::new(ctx.clone());
        let mut commodities = Vec::new();
        let mut prev = target;
        for (i, w) in weights.iter().enumerate() {
            let c = ctx.commodity(&format!("C{}", i)).unwrap();
            prices.insert(c, Decimal::new(*w, 2), prev);
            commodities.push(c);
            prev = c;
        }
        let norm = prices.normalize(target);

        let mut flat = Prices::new(ctx);
        for c in &commodities {
            flat.insert(*c, norm.price(*c).unwrap(), target);
        }
        let again = flat.normalize(target);
        for c in commodities {
            prop_assert_eq!(again.price(c), norm.price(c));
        }
    }

    #[test]
    fn diff_round_trips(
        entries in proptest::collection::vec((0u8..4, 0u8..2, -1000i64..1000), 1..40),
    ) {
        let ctx = Context::new();
        let accounts = [
            ctx.account("Assets:A").unwrap(),
            ctx.account("Assets:B").unwrap(),
            ctx.account("Income:C").unwrap(),
            ctx.account("Expenses:D").unwrap(),
        ];
        let commodities = [ctx.commodity("USD").unwrap(), ctx.commodity("EUR").unwrap()];

        // Build a sequence of cumulative snapshots.
        let mut snapshots: Vec<Positions> = Vec::new();
        let mut current = Positions::new();
        for chunk in entries.chunks(5) {
            for (a, c, v) in chunk {
                current.add(accounts[*a as usize], commodities[*c as usize], Decimal::from(*v));
            }
            snapshots.push(current.clone());
        }

        // diff, then cumulative sum back.
        let mut prev = Positions::new();
        let mut acc = Positions::new();
        for snapshot in &snapshots {
            let delta = snapshot.diff(&prev);
            prev = snapshot.clone();
            acc = acc.plus(&delta);
            let disagrees = snapshot
                .iter()
                .any(|(pos, v)| acc.get(pos).unwrap_or(Decimal::ZERO) != *v);
            prop_assert!(!disagrees);
        }
    }
}
