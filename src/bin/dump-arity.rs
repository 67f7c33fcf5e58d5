use clap::Parser;
use dispatch_rs::{fix_args, Arity, Value};
use serde::Serialize;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Show how the argument adapter lays out a call's arguments"
)]
struct Args {
    /// Required parameters before the rest parameter
    #[arg(long, default_value_t = 0)]
    required: usize,
    #[arg(long, default_value_t = 0)]
    optional: usize,
    /// Declare a rest parameter
    #[arg(long)]
    rest: bool,
    /// Required parameters after the rest parameter
    #[arg(long, default_value_t = 0)]
    post: usize,
    /// Number of arguments at the call site
    argc: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Layout {
    arity: Arity,
    argc: usize,
    slots: Vec<Slot>,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Slot {
    Arg { index: usize },
    Unset,
    Rest { indices: Vec<usize> },
}

fn describe(v: &Value) -> Slot {
    match v {
        Value::Fixnum(i) => Slot::Arg { index: *i as usize },
        Value::Array(_) => Slot::Rest {
            indices: v
                .array_items()
                .unwrap_or_default()
                .iter()
                .filter_map(Value::as_fixnum)
                .map(|i| i as usize)
                .collect(),
        },
        _ => Slot::Unset,
    }
}

fn main() -> ExitCode {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let args = Args::parse();
    let arity = Arity::from_params(args.required, args.optional, args.rest, args.post);
    if let Err(e) = arity.check(args.argc) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    // each raw argument is its own index, so the slots show where it lands
    let raw: Vec<Value> = (0..args.argc as i64).map(Value::Fixnum).collect();
    let slots = fix_args(&raw, &arity).iter().map(describe).collect();
    let layout = Layout {
        arity,
        argc: args.argc,
        slots,
    };

    if args.json {
        match serde_json::to_string_pretty(&layout) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    println!(
        "arity: min {} max {} real {} left_req {}",
        arity.min, arity.max, arity.real, arity.left_req
    );
    for (i, slot) in layout.slots.iter().enumerate() {
        match slot {
            Slot::Arg { index } => println!("  slot {i}: arg {index}"),
            Slot::Unset => println!("  slot {i}: (unset optional)"),
            Slot::Rest { indices } => println!("  slot {i}: rest {indices:?}"),
        }
    }
    ExitCode::SUCCESS
}
