use std::collections::btree_map::{self, BTreeMap};
use std::fmt;
use tracing::debug;

/// Deepest chain of inlined callees below a top level function. The readers and writers walk
/// the tree recursively so deeper stores are rejected on the way in and on the way out.
pub const MAX_INLINE_DEPTH: usize = 128;

/// How a count recorded against an existing location combines with the value already there.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub enum Operation {
    /// Add the new count to the stored one
    Sum,
    /// Keep the larger of the two counts
    Max,
}

impl Default for Operation {
    fn default() -> Self {
        Self::Sum
    }
}

impl Operation {
    pub fn apply(self, current: u64, count: u64) -> u64 {
        match self {
            Self::Sum => current.saturating_add(count),
            Self::Max => current.max(count),
        }
    }
}

/// A single frame of a source stack. The equivalent in AutoFDO would be `SourceInfo`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SourceInfo {
    pub func_name: String,
    pub dir_name: String,
    pub file_name: String,
    pub start_line: u32,
    pub line: u32,
    pub discriminator: u32,
}

impl SourceInfo {
    pub fn new(func_name: impl Into<String>, line: u32) -> Self {
        Self {
            func_name: func_name.into(),
            line,
            ..Default::default()
        }
    }

    /// Location of this frame relative to the start of its function. The line offset lives in
    /// the upper 16 bits and the discriminator in the lower 16.
    pub fn offset(&self) -> u32 {
        join_offset(self.line.wrapping_sub(self.start_line), self.discriminator)
    }
}

/// Innermost frame first, the frame of the top level function last.
pub type SourceStack = Vec<SourceInfo>;

/// Splits an encoded offset back into `(line offset, discriminator)`
pub const fn split_offset(offset: u32) -> (u32, u32) {
    (offset >> 16, offset & 0xffff)
}

pub const fn join_offset(line_offset: u32, discriminator: u32) -> u32 {
    (line_offset << 16) | (discriminator & 0xffff)
}

/// Identifies an inlined callee within its caller: the location of the call and the name of the
/// function that was inlined there.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CallsiteKey {
    pub offset: u32,
    pub callee: String,
}

impl CallsiteKey {
    pub fn new(offset: u32, callee: impl Into<String>) -> Self {
        Self {
            offset,
            callee: callee.into(),
        }
    }
}

/// Samples attributed to one location in a function.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PositionCount {
    pub count: u64,
    pub num_inst: u64,
    /// Indirect call targets seen at this location and how often they were taken
    pub targets: BTreeMap<String, u64>,
}

impl PositionCount {
    fn merge(&mut self, other: &Self, weight: u64, op: Operation) {
        self.count = op.apply(self.count, other.count.saturating_mul(weight));
        self.num_inst = self.num_inst.max(other.num_inst);
        for (target, count) in &other.targets {
            let own = self.targets.entry(target.clone()).or_default();
            *own = op.apply(*own, count.saturating_mul(weight));
        }
    }
}

/// A function or an inlined instance of one along with all the samples attributed to it. Inlined
/// callees are owned by their caller so the top level functions form trees.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FunctionSamples {
    pub name: String,
    pub dir_name: String,
    pub file_name: String,
    pub start_line: u32,
    /// Execution count at function entry. Only meaningful for top level functions.
    pub head_count: u64,
    pub pos_counts: BTreeMap<u32, PositionCount>,
    pub callsites: BTreeMap<CallsiteKey, FunctionSamples>,
}

impl FunctionSamples {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn from_frame(frame: &SourceInfo) -> Self {
        Self {
            name: frame.func_name.clone(),
            dir_name: frame.dir_name.clone(),
            file_name: frame.file_name.clone(),
            start_line: frame.start_line,
            ..Default::default()
        }
    }

    /// Walks from the outermost frame towards the innermost one creating inlined callsites as
    /// needed and returns the node the innermost frame belongs to. `stack` must not be empty.
    fn node_for_stack(&mut self, stack: &[SourceInfo]) -> &mut FunctionSamples {
        let mut node = self;
        for i in (1..stack.len()).rev() {
            let key = CallsiteKey::new(stack[i].offset(), stack[i - 1].func_name.clone());
            let callee = &stack[i - 1];
            node = node
                .callsites
                .entry(key)
                .or_insert_with(|| FunctionSamples::from_frame(callee));
        }
        node
    }

    pub fn callsite(&self, offset: u32, callee: &str) -> Option<&FunctionSamples> {
        self.callsites.get(&CallsiteKey::new(offset, callee))
    }

    /// Every sample count in this node and the inlined callees beneath it, one per location.
    pub fn sample_counts(&self) -> SampleCounts<'_> {
        SampleCounts {
            current: Some(self.pos_counts.values()),
            pending: vec![self],
            started: false,
        }
    }

    /// Sum of all the sample counts attributed to this function including inlined callees.
    pub fn total_count(&self) -> u64 {
        self.sample_counts()
            .fold(0u64, |acc, x| acc.saturating_add(x))
    }

    /// The largest single sample count in this function and its inlined callees.
    pub fn max_count(&self) -> u64 {
        self.sample_counts().max().unwrap_or_default()
    }

    /// Length of the longest chain of inlined callees beneath this node.
    pub fn inline_depth(&self) -> usize {
        let mut deepest = 0;
        let mut pending = vec![(self, 0)];
        while let Some((node, depth)) = pending.pop() {
            deepest = deepest.max(depth);
            pending.extend(node.callsites.values().map(|x| (x, depth + 1)));
        }
        deepest
    }

    /// Number of nodes in the tree rooted here, this node included
    pub fn num_nodes(&self) -> usize {
        1 + self
            .callsites
            .values()
            .map(FunctionSamples::num_nodes)
            .sum::<usize>()
    }

    pub fn merge(&mut self, other: &Self, weight: u64, op: Operation) {
        self.head_count = op.apply(self.head_count, other.head_count.saturating_mul(weight));
        if self.file_name.is_empty() && self.dir_name.is_empty() {
            self.dir_name = other.dir_name.clone();
            self.file_name = other.file_name.clone();
            self.start_line = other.start_line;
        }
        for (offset, pos) in &other.pos_counts {
            self.pos_counts
                .entry(*offset)
                .or_default()
                .merge(pos, weight, op);
        }
        for (key, callee) in &other.callsites {
            match self.callsites.get_mut(key) {
                Some(own) => own.merge(callee, weight, op),
                None => {
                    let mut callee = callee.clone();
                    if weight != 1 {
                        callee.scale(weight);
                    }
                    self.callsites.insert(key.clone(), callee);
                }
            }
        }
    }

    fn scale(&mut self, weight: u64) {
        self.head_count = self.head_count.saturating_mul(weight);
        for pos in self.pos_counts.values_mut() {
            pos.count = pos.count.saturating_mul(weight);
            for count in pos.targets.values_mut() {
                *count = count.saturating_mul(weight);
            }
        }
        for callee in self.callsites.values_mut() {
            callee.scale(weight);
        }
    }
}

/// Depth first iterator over the sample counts of a `FunctionSamples` tree. Each location yields
/// its count exactly once however deeply it is inlined.
#[derive(Clone, Debug)]
pub struct SampleCounts<'a> {
    current: Option<btree_map::Values<'a, u32, PositionCount>>,
    pending: Vec<&'a FunctionSamples>,
    started: bool,
}

impl<'a> Iterator for SampleCounts<'a> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if !self.started {
            // The root's own counts are already loaded, queue up its callees
            self.started = true;
            if let Some(root) = self.pending.pop() {
                self.pending.extend(root.callsites.values().rev());
            }
        }
        loop {
            if let Some(pos) = self.current.as_mut().and_then(|x| x.next()) {
                return Some(pos.count);
            }
            let node = self.pending.pop()?;
            self.pending.extend(node.callsites.values().rev());
            self.current = Some(node.pos_counts.values());
        }
    }
}

/// The sample store, every top level function keyed by name.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SymbolMap {
    map: BTreeMap<String, FunctionSamples>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function, does nothing if it's already present.
    pub fn add_symbol(&mut self, name: &str) {
        if !self.map.contains_key(name) {
            debug!("Adding symbol {}", name);
            self.map
                .insert(name.to_string(), FunctionSamples::new(name));
        }
    }

    /// Updates the entry count of a registered function. Returns false if the function isn't in
    /// the map.
    pub fn add_symbol_entry_count(&mut self, name: &str, count: u64, op: Operation) -> bool {
        match self.map.get_mut(name) {
            Some(func) => {
                func.head_count = op.apply(func.head_count, count);
                true
            }
            None => false,
        }
    }

    /// Records `count` at the innermost frame of `stack`. Returns false if the function isn't
    /// registered, the stack is empty or it's more than `MAX_INLINE_DEPTH` inlines deep.
    pub fn add_source_count(
        &mut self,
        name: &str,
        stack: &[SourceInfo],
        count: u64,
        op: Operation,
    ) -> bool {
        let func = match self.map.get_mut(name) {
            Some(f) if !stack.is_empty() && stack.len() <= MAX_INLINE_DEPTH + 1 => f,
            _ => return false,
        };
        let node = func.node_for_stack(stack);
        let pos = node.pos_counts.entry(stack[0].offset()).or_default();
        pos.count = op.apply(pos.count, count);
        pos.num_inst = pos.num_inst.saturating_add(1);
        true
    }

    /// Records an indirect call from the innermost frame of `stack` to `target`.
    pub fn add_indirect_call_target(
        &mut self,
        name: &str,
        stack: &[SourceInfo],
        target: &str,
        count: u64,
    ) -> bool {
        let func = match self.map.get_mut(name) {
            Some(f) if !stack.is_empty() && stack.len() <= MAX_INLINE_DEPTH + 1 => f,
            _ => return false,
        };
        let node = func.node_for_stack(stack);
        let pos = node.pos_counts.entry(stack[0].offset()).or_default();
        let own = pos.targets.entry(target.to_string()).or_default();
        *own = own.saturating_add(count);
        true
    }

    /// Inserts a fully formed function, replacing any existing one with the same name.
    pub fn insert(&mut self, func: FunctionSamples) -> Option<FunctionSamples> {
        self.map.insert(func.name.clone(), func)
    }

    pub fn get(&self, name: &str) -> Option<&FunctionSamples> {
        self.map.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionSamples> {
        self.map.values()
    }

    /// Every sample count in the store regardless of which function or inline depth it's in.
    pub fn sample_counts(&self) -> impl Iterator<Item = u64> + '_ {
        self.map.values().flat_map(FunctionSamples::sample_counts)
    }

    pub fn entry_counts(&self) -> impl Iterator<Item = u64> + '_ {
        self.map.values().map(|x| x.head_count)
    }

    pub fn merge(&mut self, other: &Self, op: Operation) {
        self.merge_weighted(other, 1, op);
    }

    /// Merges another store into this one multiplying every count in `other` by `weight`.
    pub fn merge_weighted(&mut self, other: &Self, weight: u64, op: Operation) {
        for func in other.iter() {
            match self.map.get_mut(&func.name) {
                Some(own) => own.merge(func, weight, op),
                None => {
                    let mut func = func.clone();
                    if weight != 1 {
                        func.scale(weight);
                    }
                    self.map.insert(func.name.clone(), func);
                }
            }
        }
    }
}

impl fmt::Display for SymbolMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for func in self.iter() {
            writeln!(
                f,
                "{}: total = {}, head = {}",
                func.name,
                func.total_count(),
                func.head_count
            )?;
        }
        Ok(())
    }
}
