//! gcmeta command-line tool
//!
//! Assembles stack-frame metadata images from routine descriptions and
//! inspects, verifies and scans existing images.

mod commands;
mod output;
mod routines;

use clap::{Parser, Subcommand, ValueEnum};
use gcmeta::MissingMapPolicy;
use output::{resolve_color_choice, ColorMode, StyledOutput};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gcmeta")]
#[command(about = "Stack-frame liveness metadata toolkit", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// When to color output
    #[arg(long, value_enum, default_value_t = ColorMode::Auto, global = true)]
    color: ColorMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a TOML routine description
    Assemble {
        /// Routine description file
        input: PathBuf,
        /// Output image path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print the contents of an image
    Dump {
        /// Image file
        image: PathBuf,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Check every function record of an image
    Verify {
        /// Image file
        image: PathBuf,
    },

    /// Show the metadata in effect at a pc
    Lookup {
        /// Image file
        image: PathBuf,
        /// pc (decimal or 0x-prefixed hex)
        #[arg(value_parser = commands::parse_u64)]
        pc: u64,
        /// pc is a return address
        #[arg(long)]
        call: bool,
    },

    /// Report the live roots of one frame
    Scan {
        /// Image file
        image: PathBuf,
        /// Resume pc
        #[arg(long, value_parser = commands::parse_u64)]
        pc: u64,
        /// Locals base
        #[arg(long, value_parser = commands::parse_u64)]
        varp: u64,
        /// Args base
        #[arg(long, value_parser = commands::parse_u64)]
        argp: u64,
        /// pc is a return address
        #[arg(long)]
        call: bool,
        /// Policy for locals without a pointer map
        #[arg(long, value_enum, default_value_t = PolicyArg::Conservative)]
        missing_locals: PolicyArg,
        /// Policy for arguments without a pointer map
        #[arg(long, value_enum, default_value_t = PolicyArg::Conservative)]
        missing_args: PolicyArg,
        /// Scan frames stopped at unsafe points
        #[arg(long)]
        allow_unsafe: bool,
        /// Contents of the open-coded defer bitmask, to list pending calls
        #[arg(long, value_parser = commands::parse_u8)]
        defer_bits: Option<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    Conservative,
    Skip,
}

impl From<PolicyArg> for MissingMapPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Conservative => MissingMapPolicy::Conservative,
            PolicyArg::Skip => MissingMapPolicy::Skip,
        }
    }
}

fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    match verbose {
        0 => {}
        1 => {
            builder.filter_level(log::LevelFilter::Info);
        }
        2 => {
            builder.filter_level(log::LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
        }
    }
    builder.format_timestamp(None).init();
}

fn run(command: Commands, out: &mut StyledOutput) -> anyhow::Result<()> {
    match command {
        Commands::Assemble { input, output } => commands::assemble::execute(&input, &output, out),
        Commands::Dump { image, json } => commands::dump::execute(&image, json, out),
        Commands::Verify { image } => commands::verify::execute(&image, out),
        Commands::Lookup { image, pc, call } => commands::lookup::execute(&image, pc, call, out),
        Commands::Scan {
            image,
            pc,
            varp,
            argp,
            call,
            missing_locals,
            missing_args,
            allow_unsafe,
            defer_bits,
        } => {
            let frame = gcmeta::FrameContext {
                pc,
                varp,
                argp,
                at_call: call,
            };
            let options = gcmeta::ScanOptions {
                missing_locals: missing_locals.into(),
                missing_args: missing_args.into(),
                allow_unsafe_points: allow_unsafe,
            };
            commands::scan::execute(&image, &frame, options, defer_bits, out)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut out = StyledOutput::new(resolve_color_choice(cli.color));
    let result = run(cli.command, &mut out);
    out.flush();
    if let Err(e) = result {
        out.stderr_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
