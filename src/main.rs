use std::{error::Error, path::PathBuf, sync::Arc, sync::Mutex};

use clap::{ArgGroup, Args, Parser, Subcommand};
use time::{macros::format_description, Date, OffsetDateTime};

use daybook::{
    balancer::Balancer,
    context::Context,
    journal::{AccountCommodityFilter, JournalSource},
    performance::FlowComputer,
    period::{Differ, Interval, PeriodFilter},
    pipeline::Engine,
    prices::PriceUpdater,
    report::{
        account_mapper, BalanceBuilder, BalanceRenderer, Format, MappingRule, PerformanceBuilder,
        PerformanceRenderer, Query, Register, RegisterBuilder,
    },
    valuator::Valuator,
};

#[derive(Parser)]
#[command(name = "daybook", about = "Plain-text double-entry accounting")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compute a balance for a date or set of dates
    Balance(BalanceArgs),
    /// List postings per period
    Register(RegisterArgs),
    /// Compute portfolio performance per period
    Performance(PerformanceArgs),
    /// Format journal files in place
    Format(FormatArgs),
}

fn parse_date(s: &str) -> Result<Date, String> {
    Date::parse(s, format_description!("[year]-[month]-[day]")).map_err(|e| e.to_string())
}

fn parse_regex(s: &str) -> Result<regex::Regex, String> {
    regex::Regex::new(s).map_err(|e| e.to_string())
}

#[derive(Args)]
#[command(group(ArgGroup::new("interval").args(["days", "weeks", "months", "quarters", "years"])))]
struct CommonArgs {
    /// Journal file
    journal: PathBuf,

    /// Start of the reporting window
    #[arg(long, value_parser = parse_date)]
    from: Option<Date>,

    /// End of the reporting window (defaults to today)
    #[arg(long, value_parser = parse_date)]
    to: Option<Date>,

    /// Keep only the last N periods
    #[arg(long, default_value_t = 0)]
    last: usize,

    /// Show per-period deltas instead of cumulative snapshots
    #[arg(long, short = 'd')]
    diff: bool,

    /// Valuate positions in the given commodity
    #[arg(long = "val", short = 'v')]
    valuation: Option<String>,

    /// Filter accounts with a regex
    #[arg(long, value_parser = parse_regex)]
    account: Option<regex::Regex>,

    /// Filter commodities with a regex
    #[arg(long, value_parser = parse_regex)]
    commodity: Option<regex::Regex>,

    /// Round to a number of digits
    #[arg(long)]
    digits: Option<u32>,

    /// Show numbers in units of 1000
    #[arg(long, short = 'k')]
    thousands: bool,

    /// Print output in color
    #[arg(long)]
    color: bool,

    #[arg(long)]
    days: bool,
    #[arg(long)]
    weeks: bool,
    #[arg(long)]
    months: bool,
    #[arg(long)]
    quarters: bool,
    #[arg(long)]
    years: bool,
}

impl CommonArgs {
    fn interval(&self) -> Interval {
        if self.days {
            Interval::Daily
        } else if self.weeks {
            Interval::Weekly
        } else if self.months {
            Interval::Monthly
        } else if self.quarters {
            Interval::Quarterly
        } else if self.years {
            Interval::Yearly
        } else {
            Interval::Once
        }
    }

    fn to(&self) -> Date {
        self.to.unwrap_or_else(|| OffsetDateTime::now_utc().date())
    }

    fn filter(&self) -> AccountCommodityFilter {
        AccountCommodityFilter {
            accounts: self.account.clone(),
            commodities: self.commodity.clone(),
        }
    }

    fn format(&self) -> Format {
        Format {
            thousands: self.thousands,
            digits: self.digits,
            color: self.color,
        }
    }
}

#[derive(Args)]
struct BalanceArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Show commodities on their own rows
    #[arg(long, short = 's')]
    show_commodities: bool,

    /// Sort accounts alphabetically instead of in tree order
    #[arg(long, short = 'a')]
    sort: bool,

    /// Shorten matching accounts to a number of segments: <level>,<regex>
    #[arg(long = "map", short = 'm', value_parser = MappingRule::parse)]
    mapping: Vec<MappingRule>,
}

#[derive(Args)]
struct RegisterArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Shorten matching accounts to a number of segments: <level>,<regex>
    #[arg(long = "map", short = 'm', value_parser = MappingRule::parse)]
    mapping: Vec<MappingRule>,
}

#[derive(Args)]
struct PerformanceArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Portfolio accounts, as a regex over asset/liability account names
    #[arg(long, value_parser = parse_regex)]
    portfolio: Option<regex::Regex>,
}

#[derive(Args)]
struct FormatArgs {
    /// Files to format in place
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("warn"));
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Balance(args) => run_balance(args).await,
        Command::Register(args) => run_register(args).await,
        Command::Performance(args) => run_performance(args).await,
        Command::Format(args) => daybook::format::format_files(args.files)
            .await
            .map_err(|e| e.into()),
    };
    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn build_engine(
    ctx: &Context,
    common: &CommonArgs,
    sink: Box<dyn daybook::pipeline::Sink>,
) -> Result<Engine, Box<dyn Error>> {
    let valuation = match &common.valuation {
        Some(name) => Some(ctx.commodity(name)?),
        None => None,
    };
    let source = JournalSource {
        ctx: ctx.clone(),
        path: common.journal.clone(),
        filter: common.filter(),
        expand: true,
    };
    let mut engine = Engine::new(Box::new(source), sink);
    engine.add(Box::new(Balancer { ctx: ctx.clone() }));
    engine.add(Box::new(PriceUpdater {
        ctx: ctx.clone(),
        valuation,
    }));
    engine.add(Box::new(Valuator {
        ctx: ctx.clone(),
        valuation,
    }));
    engine.add(Box::new(PeriodFilter {
        from: common.from,
        to: common.to(),
        interval: common.interval(),
        last: common.last,
    }));
    engine.add(Box::new(Differ { diff: common.diff }));
    Ok(engine)
}

async fn run_balance(args: BalanceArgs) -> Result<(), Box<dyn Error>> {
    let ctx = Context::new();
    let valuation = match &args.common.valuation {
        Some(name) => Some(ctx.commodity(name)?),
        None => None,
    };
    let builder = BalanceBuilder::default();
    let engine = build_engine(&ctx, &args.common, Box::new(builder.clone()))?;
    engine.process().await?;

    let renderer = BalanceRenderer {
        ctx: ctx.clone(),
        valuation,
        show_commodities: args.show_commodities,
        sort_alphabetically: args.sort,
        mapping: args.mapping,
        format: args.common.format(),
    };
    let days = builder.days.lock().unwrap();
    print!("{}", renderer.render(&days));
    Ok(())
}

async fn run_performance(args: PerformanceArgs) -> Result<(), Box<dyn Error>> {
    let ctx = Context::new();
    let valuation = match &args.common.valuation {
        Some(name) => ctx.commodity(name)?,
        None => return Err("the performance report requires --val".into()),
    };
    if args.common.diff {
        return Err("--diff is not supported for the performance report".into());
    }
    let portfolio = match args.portfolio {
        Some(re) => re,
        None => regex::Regex::new(".*").unwrap(),
    };

    let source = JournalSource {
        ctx: ctx.clone(),
        path: args.common.journal.clone(),
        filter: args.common.filter(),
        expand: true,
    };
    let builder = PerformanceBuilder::default();
    let mut engine = Engine::new(Box::new(source), Box::new(builder.clone()));
    engine.add(Box::new(Balancer { ctx: ctx.clone() }));
    engine.add(Box::new(PriceUpdater {
        ctx: ctx.clone(),
        valuation: Some(valuation),
    }));
    engine.add(Box::new(Valuator {
        ctx: ctx.clone(),
        valuation: Some(valuation),
    }));
    engine.add(Box::new(PeriodFilter {
        from: args.common.from,
        to: args.common.to(),
        interval: args.common.interval(),
        last: args.common.last,
    }));
    engine.add(Box::new(FlowComputer {
        ctx: ctx.clone(),
        valuation,
        portfolio,
    }));
    engine.process().await?;

    let renderer = PerformanceRenderer {
        format: args.common.format(),
    };
    let days = builder.days.lock().unwrap();
    print!("{}", renderer.render(&days));
    Ok(())
}

async fn run_register(args: RegisterArgs) -> Result<(), Box<dyn Error>> {
    let ctx = Context::new();
    let valuation = match &args.common.valuation {
        Some(name) => Some(ctx.commodity(name)?),
        None => None,
    };
    let register = Arc::new(Mutex::new(Register::new(ctx.clone())));
    let sink = RegisterBuilder {
        query: Query {
            filter: None,
            mapper: if args.mapping.is_empty() {
                None
            } else {
                Some(account_mapper(ctx.clone(), args.mapping.clone()))
            },
            valuation,
        },
        register: register.clone(),
    };
    let engine = build_engine(&ctx, &args.common, Box::new(sink))?;
    engine.process().await?;

    let register = register.lock().unwrap();
    print!("{}", register.to_table(args.common.format()));
    Ok(())
}
