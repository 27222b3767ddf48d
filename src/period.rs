use std::{fmt, sync::Arc};

use async_trait::async_trait;
use time::{Date, Duration, Month};
use tokio::sync::mpsc;

use crate::{
    amounts::Positions,
    ast::Transaction,
    journal::Day,
    pipeline::{push, ProcessError, Stage},
    prices::NormalizedPrices,
};

/// Aggregation interval. Weeks run Monday through Sunday; months,
/// quarters and years end on their last calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Once,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Interval::Once => "once",
            Interval::Daily => "daily",
            Interval::Weekly => "weekly",
            Interval::Monthly => "monthly",
            Interval::Quarterly => "quarterly",
            Interval::Yearly => "yearly",
        };
        f.write_str(s)
    }
}

/// One aggregation period; both endpoints inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub start: Date,
    pub end: Date,
}

fn end_of_month(d: Date) -> Date {
    let last = time::util::days_in_year_month(d.year(), d.month());
    d.replace_day(last).unwrap()
}

/// The last date of the period containing `d`.
pub fn end_of(d: Date, interval: Interval) -> Date {
    match interval {
        Interval::Once | Interval::Daily => d,
        Interval::Weekly => {
            let offset = 6 - d.weekday().number_days_from_monday() as i64;
            d + Duration::days(offset)
        }
        Interval::Monthly => end_of_month(d),
        Interval::Quarterly => {
            let month = match d.month() {
                Month::January | Month::February | Month::March => Month::March,
                Month::April | Month::May | Month::June => Month::June,
                Month::July | Month::August | Month::September => Month::September,
                Month::October | Month::November | Month::December => Month::December,
            };
            end_of_month(d.replace_day(1).unwrap().replace_month(month).unwrap())
        }
        Interval::Yearly => Date::from_calendar_date(d.year(), Month::December, 31).unwrap(),
    }
}

/// The first date of the period containing `d`.
pub fn start_of(d: Date, interval: Interval) -> Date {
    match interval {
        Interval::Once | Interval::Daily => d,
        Interval::Weekly => {
            let offset = d.weekday().number_days_from_monday() as i64;
            d - Duration::days(offset)
        }
        Interval::Monthly => d.replace_day(1).unwrap(),
        Interval::Quarterly => {
            let month = match d.month() {
                Month::January | Month::February | Month::March => Month::January,
                Month::April | Month::May | Month::June => Month::April,
                Month::July | Month::August | Month::September => Month::July,
                Month::October | Month::November | Month::December => Month::October,
            };
            d.replace_day(1).unwrap().replace_month(month).unwrap()
        }
        Interval::Yearly => Date::from_calendar_date(d.year(), Month::January, 1).unwrap(),
    }
}

/// The ordered periods covering `[t0, t1]`. The first period starts at
/// `t0` and the last ends at `t1`, both clamped into the window.
pub fn periods(t0: Date, t1: Date, interval: Interval) -> Vec<Period> {
    let mut res = Vec::new();
    if t0 > t1 {
        return res;
    }
    if interval == Interval::Once {
        res.push(Period { start: t0, end: t1 });
        return res;
    }
    let mut start = t0;
    loop {
        let end = end_of(start, interval).min(t1);
        res.push(Period { start, end });
        if end >= t1 {
            break;
        }
        start = end.next_day().unwrap();
    }
    res
}

/// Restricts the stream to a date window and collapses it to one snapshot
/// day per period, carrying the cumulative state at the period's last
/// covered date plus the period's transactions.
pub struct PeriodFilter {
    pub from: Option<Date>,
    pub to: Date,
    pub interval: Interval,
    pub last: usize,
}

impl PeriodFilter {
    fn snapshot(
        &self,
        date: Date,
        amounts: &Positions,
        value: &Positions,
        normalized: Option<Arc<NormalizedPrices>>,
        pending: &mut Vec<Transaction>,
    ) -> Day {
        let mut day = Day::new(date);
        let (in_period, rest): (Vec<Transaction>, Vec<Transaction>) =
            pending.drain(..).partition(|t| t.date <= date);
        *pending = rest;
        day.transactions = in_period;
        day.amounts = amounts.clone();
        day.value = value.clone();
        day.normalized = normalized;
        day
    }
}

#[async_trait]
impl Stage for PeriodFilter {
    fn name(&self) -> &'static str {
        "period filter"
    }

    async fn run(
        &mut self,
        mut input: mpsc::Receiver<Day>,
        out: mpsc::Sender<Day>,
    ) -> Result<(), ProcessError> {
        let mut boundaries: Vec<Date> = Vec::new();
        let mut started = false;
        let mut idx = 0;
        let mut amounts = Positions::new();
        let mut value = Positions::new();
        let mut normalized = None;
        let mut pending: Vec<Transaction> = Vec::new();
        let mut emitted: Vec<Day> = Vec::new();

        while let Some(day) = input.recv().await {
            if !started {
                started = true;
                boundaries = periods(self.from.unwrap_or(day.date), self.to, self.interval)
                    .iter()
                    .map(|p| p.end)
                    .collect();
            }
            if day.date > self.to {
                continue;
            }
            while idx < boundaries.len() && boundaries[idx] < day.date {
                let snap = self.snapshot(
                    boundaries[idx],
                    &amounts,
                    &value,
                    normalized.clone(),
                    &mut pending,
                );
                emitted.push(snap);
                idx += 1;
            }
            amounts = day.amounts;
            value = day.value;
            normalized = day.normalized;
            // Days before the window feed the cumulative state only.
            if self.from.map_or(true, |from| day.date >= from) {
                pending.extend(day.transactions);
            }
        }
        while idx < boundaries.len() {
            let snap = self.snapshot(
                boundaries[idx],
                &amounts,
                &value,
                normalized.clone(),
                &mut pending,
            );
            emitted.push(snap);
            idx += 1;
        }
        if self.last > 0 && emitted.len() > self.last {
            emitted.drain(..emitted.len() - self.last);
        }
        for day in emitted {
            push(&out, day).await?;
        }
        Ok(())
    }
}

/// Turns cumulative period snapshots into per-period deltas. The first
/// period passes through unchanged; absent positions count as zero.
pub struct Differ {
    pub diff: bool,
}

#[async_trait]
impl Stage for Differ {
    fn name(&self) -> &'static str {
        "differ"
    }

    async fn run(
        &mut self,
        mut input: mpsc::Receiver<Day>,
        out: mpsc::Sender<Day>,
    ) -> Result<(), ProcessError> {
        let mut prev_amounts = Positions::new();
        let mut prev_value = Positions::new();
        while let Some(mut day) = input.recv().await {
            if self.diff {
                let amounts = day.amounts.diff(&prev_amounts);
                let value = day.value.diff(&prev_value);
                prev_amounts = day.amounts;
                prev_value = day.value;
                day.amounts = amounts;
                day.value = value;
            }
            push(&out, day).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_end_of_week() {
        // 2023-01-04 is a Wednesday; the week ends Sunday 2023-01-08.
        assert_eq!(end_of(date!(2023 - 01 - 04), Interval::Weekly), date!(2023 - 01 - 08));
        assert_eq!(end_of(date!(2023 - 01 - 08), Interval::Weekly), date!(2023 - 01 - 08));
        assert_eq!(start_of(date!(2023 - 01 - 04), Interval::Weekly), date!(2023 - 01 - 02));
    }

    #[test]
    fn test_end_of_month_quarter_year() {
        assert_eq!(end_of(date!(2023 - 02 - 11), Interval::Monthly), date!(2023 - 02 - 28));
        assert_eq!(end_of(date!(2024 - 02 - 11), Interval::Monthly), date!(2024 - 02 - 29));
        assert_eq!(end_of(date!(2023 - 05 - 11), Interval::Quarterly), date!(2023 - 06 - 30));
        assert_eq!(end_of(date!(2023 - 11 - 02), Interval::Quarterly), date!(2023 - 12 - 31));
        assert_eq!(end_of(date!(2023 - 03 - 01), Interval::Yearly), date!(2023 - 12 - 31));
    }

    #[test]
    fn test_periods_monthly() {
        let ps = periods(date!(2023 - 01 - 01), date!(2023 - 12 - 31), Interval::Monthly);
        assert_eq!(ps.len(), 12);
        assert_eq!(ps[0].start, date!(2023 - 01 - 01));
        assert_eq!(ps[0].end, date!(2023 - 01 - 31));
        assert_eq!(ps[11].end, date!(2023 - 12 - 31));
    }

    #[test]
    fn test_periods_clamp_partial() {
        let ps = periods(date!(2023 - 01 - 15), date!(2023 - 03 - 10), Interval::Monthly);
        assert_eq!(ps.len(), 3);
        assert_eq!(ps[0].start, date!(2023 - 01 - 15));
        assert_eq!(ps[0].end, date!(2023 - 01 - 31));
        assert_eq!(ps[2].end, date!(2023 - 03 - 10));
    }

    #[test]
    fn test_periods_once() {
        let ps = periods(date!(2023 - 01 - 15), date!(2023 - 03 - 10), Interval::Once);
        assert_eq!(ps.len(), 1);
        assert_eq!(ps[0].start, date!(2023 - 01 - 15));
        assert_eq!(ps[0].end, date!(2023 - 03 - 10));
    }

    #[test]
    fn test_periods_empty_window() {
        assert!(periods(date!(2023 - 03 - 10), date!(2023 - 01 - 15), Interval::Daily).is_empty());
    }
}
