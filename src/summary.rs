//! Profile summaries. A summary condenses every sample count in a profile into a handful of
//! totals and a digest describing how many of the hottest counts are needed to cover a given
//! fraction of all samples. Compilers use the digest to pick hot and cold thresholds.
use crate::sample_profile::types::SymbolMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Cutoffs are expressed in parts per million of the total count.
pub const CUTOFF_SCALE: u64 = 1_000_000;

/// The cutoffs used when writing profiles. Matches the list LLVM's `ProfileSummaryBuilder` uses.
pub const DEFAULT_CUTOFFS: [u32; 16] = [
    10000, 100000, 200000, 300000, 400000, 500000, 600000, 700000, 800000, 900000, 950000,
    990000, 999000, 999900, 999990, 999999,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Error)]
pub enum SummaryError {
    #[error("Cutoff {0} is larger than 1000000")]
    InvalidCutoff(u32),
    #[error("Total sample count overflowed a 64 bit integer")]
    CountOverflow,
}

/// One entry of the detailed summary. Taking counts from largest to smallest, `num_counts` of
/// them are needed for their sum to reach `cutoff` parts per million of the total count and the
/// smallest of those is `min_count`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DetailedSummary {
    pub cutoff: u32,
    pub min_count: u64,
    pub num_counts: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProfileSummary {
    pub total_count: u64,
    pub max_count: u64,
    pub max_function_count: u64,
    pub num_counts: u64,
    pub num_functions: u64,
    pub detailed_summaries: Vec<DetailedSummary>,
}

impl ProfileSummary {
    /// Computes the summary of every sample count in `symbols`. The store isn't modified.
    pub fn compute(symbols: &SymbolMap, cutoffs: &[u32]) -> Result<Self, SummaryError> {
        let mut builder = ProfileSummaryBuilder::new();
        for func in symbols.iter() {
            builder.add_function(func.head_count);
            for count in func.sample_counts() {
                builder.add_count(count);
            }
        }
        builder.build(cutoffs)
    }

    /// The smallest count still considered hot at `cutoff`, if that cutoff was part of the
    /// detailed summary.
    pub fn hot_count_threshold(&self, cutoff: u32) -> Option<u64> {
        self.detailed_summaries
            .iter()
            .find(|x| x.cutoff == cutoff)
            .map(|x| x.min_count)
    }
}

impl fmt::Display for ProfileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total functions: {}", self.num_functions)?;
        writeln!(f, "Maximum function count: {}", self.max_function_count)?;
        writeln!(f, "Maximum sample count: {}", self.max_count)?;
        writeln!(f, "Total number of counts: {}", self.num_counts)?;
        writeln!(f, "Total count: {}", self.total_count)?;
        write!(
            f,
            "Detailed summary:\n{} cutoffs",
            self.detailed_summaries.len()
        )?;
        for entry in &self.detailed_summaries {
            let percent = entry.cutoff as f64 / 10000.0;
            write!(
                f,
                "\n{} count(s) with count >= {} account for {} percentage of the total counts.",
                entry.num_counts, entry.min_count, percent
            )?;
        }
        Ok(())
    }
}

/// Accumulates sample counts and function entry counts until a summary is needed.
#[derive(Clone, Debug, Default)]
pub struct ProfileSummaryBuilder {
    counts: Vec<u64>,
    total_count: u64,
    overflowed: bool,
    max_count: u64,
    max_function_count: u64,
    num_functions: u64,
}

impl ProfileSummaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, entry_count: u64) {
        self.num_functions += 1;
        if entry_count > self.max_function_count {
            self.max_function_count = entry_count;
        }
    }

    pub fn add_count(&mut self, count: u64) {
        match self.total_count.checked_add(count) {
            Some(total) => self.total_count = total,
            None => self.overflowed = true,
        }
        if count > self.max_count {
            self.max_count = count;
        }
        self.counts.push(count);
    }

    pub fn build(&self, cutoffs: &[u32]) -> Result<ProfileSummary, SummaryError> {
        if self.overflowed {
            return Err(SummaryError::CountOverflow);
        }
        if let Some(bad) = cutoffs.iter().find(|x| u64::from(**x) > CUTOFF_SCALE) {
            return Err(SummaryError::InvalidCutoff(*bad));
        }
        let mut sorted = self.counts.clone();
        // Stable so equal counts keep the order they were added in
        sorted.sort_by(|a, b| b.cmp(a));

        let detailed_summaries = cutoffs
            .iter()
            .map(|cutoff| detailed_summary(&sorted, self.total_count, *cutoff))
            .collect();

        let summary = ProfileSummary {
            total_count: self.total_count,
            max_count: self.max_count,
            max_function_count: self.max_function_count,
            num_counts: sorted.len() as u64,
            num_functions: self.num_functions,
            detailed_summaries,
        };
        debug!("Computed summary {:?}", summary);
        Ok(summary)
    }
}

/// `sorted` must be in descending order and sum to `total`.
fn detailed_summary(sorted: &[u64], total: u64, cutoff: u32) -> DetailedSummary {
    let mut result = DetailedSummary {
        cutoff,
        ..Default::default()
    };
    if total == 0 {
        return result;
    }
    // running_sum / total >= cutoff / SCALE, kept in integers so the boundary is exact
    let desired = u128::from(cutoff) * u128::from(total);
    let mut running_sum = 0u128;
    for (i, count) in sorted.iter().enumerate() {
        running_sum += u128::from(*count);
        if running_sum * u128::from(CUTOFF_SCALE) >= desired {
            result.min_count = *count;
            result.num_counts = i as u64 + 1;
            break;
        }
    }
    result
}
