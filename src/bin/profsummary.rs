use anyhow::{anyhow, bail, Context, Result};
use sample_profdata::sample_profile::binary_profile::FormatVersion;
use sample_profdata::sample_profile::binary_writer::BinaryProfWriter;
use sample_profdata::sample_profile::text_profile::TextProfWriter;
use sample_profdata::sample_profile::types::*;
use sample_profdata::sample_profile::SampleProfWriter;
use sample_profdata::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::convert::TryFrom;
use std::path::PathBuf;
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Eq, PartialEq, StructOpt)]
pub enum Command {
    Show {
        #[structopt(flatten)]
        show: ShowCommand,
    },
    Merge {
        #[structopt(flatten)]
        merge: MergeCommand,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, StructOpt)]
pub struct ShowCommand {
    /// Sample profile to show some information about
    #[structopt(name = "<filename>", long = "input", short = "i")]
    input: PathBuf,
    /// Show sample counts for shown functions
    #[structopt(long = "counts")]
    show_counts: bool,
    /// Details for every function
    #[structopt(long = "all-functions")]
    all_functions: bool,
    /// Details for functions whose name contains this string
    #[structopt(long = "function")]
    function: Option<String>,
    /// Show detailed profile summary
    #[structopt(long = "detailed-summary")]
    show_detailed_summary: bool,
    /// Show the list of functions with the largest sample counts
    #[structopt(long = "topn")]
    topn: Option<usize>,
}

#[derive(Clone, Debug, Eq, PartialEq, StructOpt)]
pub struct MergeCommand {
    /// Input files to merge
    #[structopt(name = "<filename...>", long = "input", short = "i")]
    input: Vec<PathBuf>,
    /// List of weights and filenames in `<weight>,<filename>` format
    #[structopt(long = "weighted-input", parse(try_from_str=try_parse_weighted))]
    weighted_input: Vec<(u64, String)>,
    /// Output file
    #[structopt(long = "output", short = "o")]
    output: PathBuf,
    /// Binary format version to write
    #[structopt(long = "format-version", default_value = "3")]
    format_version: u64,
    /// Write a text profile instead of a binary one
    #[structopt(long = "text")]
    text: bool,
    /// Compress the name table if the format version supports it
    #[structopt(long = "compress-names")]
    compress_names: bool,
    /// Keep the maximum of repeated counts instead of summing them
    #[structopt(long = "max")]
    max: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, StructOpt)]
pub struct Opts {
    #[structopt(subcommand)]
    cmd: Command,
}

fn try_parse_weighted(input: &str) -> Result<(u64, String), String> {
    if !input.contains(',') {
        Ok((1, input.to_string()))
    } else {
        let parts = input.split(',').collect::<Vec<_>>();
        if parts.len() != 2 {
            Err("Unexpected weighting format, expected $weight,$name or just $name".to_string())
        } else {
            let weight = parts[0]
                .parse()
                .map_err(|e| format!("Invalid weight: {}", e))?;
            if weight < 1 {
                Err("Weight must be positive integer".to_string())
            } else {
                Ok((weight, parts[1].to_string()))
            }
        }
    }
}

fn check_function(name: &str, pattern: Option<&String>) -> bool {
    match pattern {
        Some(pat) => name.contains(pat.as_str()),
        None => false,
    }
}

#[derive(Clone, Debug, Eq)]
struct HotFn {
    name: String,
    count: u64,
}

impl PartialOrd for HotFn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HotFn {
    fn cmp(&self, other: &Self) -> Ordering {
        // Do the reverse here
        other.count.cmp(&self.count)
    }
}

impl PartialEq for HotFn {
    fn eq(&self, other: &Self) -> bool {
        self.count == other.count
    }
}

fn print_body(func: &FunctionSamples, depth: usize) {
    let indent = "  ".repeat(depth + 2);
    for (offset, pos) in &func.pos_counts {
        let (line, disc) = split_offset(*offset);
        print!("{}{}.{}: {}", indent, line, disc, pos.count);
        for (target, count) in &pos.targets {
            print!(" {}:{}", target, count);
        }
        println!();
    }
    for (key, callee) in &func.callsites {
        let (line, disc) = split_offset(key.offset);
        println!(
            "{}{}.{}: inlined {} (total = {})",
            indent,
            line,
            disc,
            callee.name,
            callee.total_count()
        );
        print_body(callee, depth + 1);
    }
}

impl ShowCommand {
    pub fn run(&self) -> Result<()> {
        let profile = parse(&self.input)
            .with_context(|| format!("Failed to read {}", self.input.display()))?;
        let summary = profile.summary_or_compute()?;

        let topn = self.topn.unwrap_or_default();
        let mut hotties = BinaryHeap::<HotFn>::with_capacity(topn);
        let mut shown_funcs = 0;
        for func in profile.symbols.iter() {
            let func_max = func.max_count();
            if topn > 0 {
                if hotties.len() == topn {
                    if hotties.peek().map(|x| x.count < func_max).unwrap_or(false) {
                        hotties.pop();
                        hotties.push(HotFn {
                            name: func.name.clone(),
                            count: func_max,
                        });
                    }
                } else {
                    hotties.push(HotFn {
                        name: func.name.clone(),
                        count: func_max,
                    });
                }
            }
            let show = self.all_functions || check_function(&func.name, self.function.as_ref());
            if show {
                if shown_funcs == 0 {
                    println!("Functions:");
                }
                shown_funcs += 1;
                println!("  {}:", func.name);
                println!("    Head count: {}", func.head_count);
                println!("    Total samples: {}", func.total_count());
                println!("    Inlined callees: {}", func.num_nodes() - 1);
                if self.show_counts {
                    print_body(func, 0);
                }
            }
        }
        match (profile.format, profile.version) {
            (Some(ProfileFormat::Binary), Some(version)) => {
                println!("Format: binary version {}", version)
            }
            _ => println!("Format: text"),
        }
        if self.all_functions || self.function.is_some() {
            println!("Functions shown: {}", shown_funcs);
        }
        if self.show_detailed_summary {
            println!("{}", summary);
        } else {
            println!("Total functions: {}", summary.num_functions);
            println!("Maximum function count: {}", summary.max_function_count);
            println!("Maximum sample count: {}", summary.max_count);
            println!("Total count: {}", summary.total_count);
        }
        if let Some(topn) = self.topn {
            println!("Top {} functions with the largest sample counts: ", topn);
            let hotties = hotties.into_sorted_vec();
            for f in hotties.iter() {
                println!("  {}, max count = {}", f.name, f.count);
            }
        }
        Ok(())
    }
}

impl MergeCommand {
    fn inputs(&self) -> Vec<(u64, PathBuf)> {
        self.input
            .iter()
            .map(|x| (1, x.clone()))
            .chain(
                self.weighted_input
                    .iter()
                    .map(|(w, x)| (*w, PathBuf::from(x))),
            )
            .collect()
    }

    fn run(&self) -> Result<()> {
        let inputs = self.inputs();
        if inputs.is_empty() {
            bail!("No input files selected. See merge --help");
        }
        let op = if self.max {
            Operation::Max
        } else {
            Operation::Sum
        };
        let mut symbols = SymbolMap::new();
        for (weight, path) in &inputs {
            let profile =
                parse(path).with_context(|| format!("Failed to read {}", path.display()))?;
            info!(
                "Merging {} functions from {}",
                profile.symbols.len(),
                path.display()
            );
            symbols.merge_weighted(&profile.symbols, *weight, op);
        }

        if self.text {
            TextProfWriter::new().write_to_file(&symbols, &self.output)?;
        } else {
            let version = FormatVersion::try_from(self.format_version)
                .map_err(|v| anyhow!("Unsupported format version {}", v))?;
            BinaryProfWriter::new(version)
                .with_compressed_names(self.compress_names)
                .write_to_file(&symbols, &self.output)?;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let opts = Opts::from_args();
    match opts.cmd {
        Command::Show { show } => show.run(),
        Command::Merge { merge } => merge.run(),
    }
}
