// Reference extraction: strip non-plain values out of a value graph so the rest
// can travel as plain data, and write them back on the receiving side.

use crate::error::RpcError;
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace};

/// Prefix reserved for cyclic and reused back references
pub const CYCLIC_PREFIX: char = 'c';

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractError {
    #[error("prefix '{0}' is reserved for back references")]
    ReservedPrefix(char),

    #[error("prefix '{0}' is already registered")]
    DuplicatePrefix(char),

    #[error("value at '{path}' refers back to one of its ancestors")]
    Cycle { path: String },

    #[error("malformed reference id '{0}'")]
    MalformedId(String),

    #[error("reference '{id}' points at '{path}', which cannot be written")]
    InvalidPath { id: String, path: String },
}

impl From<ExtractError> for RpcError {
    fn from(err: ExtractError) -> Self {
        RpcError::bad_request(err.to_string())
    }
}

/// How many container levels the walk may enter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Limited(usize),
    Unbounded,
}

impl Depth {
    fn allows(&self, level: usize) -> bool {
        match self {
            Depth::Limited(max) => level < *max,
            Depth::Unbounded => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub depth: Depth,
    /// Walk into arrays as well as objects
    pub recurse_arrays: bool,
    /// Replace repeated identities with `c-` back references
    pub cyclic: bool,
    /// Keep identities across `extract` calls until `destroy`
    pub reuse: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            depth: Depth::Limited(1),
            recurse_arrays: true,
            cyclic: false,
            reuse: false,
        }
    }
}

/// Output of one extraction pass
#[derive(Debug, Clone)]
pub struct Extracted {
    pub replaced: Value,
    /// Reference id to original value, in walk order
    pub references: IndexMap<String, Value>,
}

impl Extracted {
    pub fn is_plain(&self) -> bool {
        self.references.is_empty()
    }
}

type Matcher = dyn Fn(&Value) -> bool + Send + Sync;

struct Slot {
    value: Value,
    walk: u64,
    path: String,
}

/// Walks values, replacing matched sub-values with `<prefix>-<path>` ids.
///
/// Identity tracking is an arena of retained values plus an index from
/// identity to arena slot. With `reuse` the arena outlives a single pass and
/// keeps every distinct value it has seen alive; the owner releases it with
/// [`Extractor::destroy`] or by dropping the extractor.
pub struct Extractor {
    config: ExtractorConfig,
    matchers: Vec<(char, Box<Matcher>)>,
    arena: Vec<Slot>,
    index: HashMap<usize, usize>,
    walk: u64,
}

impl Extractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Extractor {
            config,
            matchers: Vec::new(),
            arena: Vec::new(),
            index: HashMap::new(),
            walk: 0,
        }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Register a matcher. The first matching prefix wins.
    pub fn support<F>(&mut self, prefix: char, matcher: F) -> Result<(), ExtractError>
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        if prefix == CYCLIC_PREFIX {
            return Err(ExtractError::ReservedPrefix(prefix));
        }
        if self.matchers.iter().any(|(p, _)| *p == prefix) {
            return Err(ExtractError::DuplicatePrefix(prefix));
        }
        self.matchers.push((prefix, Box::new(matcher)));
        Ok(())
    }

    pub fn prefixes(&self) -> Vec<char> {
        self.matchers.iter().map(|(p, _)| *p).collect()
    }

    /// Number of values held by the identity arena
    pub fn tracked(&self) -> usize {
        self.arena.len()
    }

    pub fn extract(&mut self, value: &Value) -> Result<Extracted, ExtractError> {
        self.walk += 1;
        let mut references = IndexMap::new();
        let mut path = Vec::new();
        let mut ancestors = Vec::new();
        let result = self.visit(value, 0, &mut path, &mut ancestors, &mut references);
        if !self.config.reuse {
            self.arena.clear();
            self.index.clear();
        }
        let replaced = result?;
        debug!(
            walk = self.walk,
            references = references.len(),
            tracked = self.arena.len(),
            "extracted references"
        );
        Ok(Extracted {
            replaced,
            references,
        })
    }

    fn visit(
        &mut self,
        value: &Value,
        level: usize,
        path: &mut Vec<String>,
        ancestors: &mut Vec<usize>,
        references: &mut IndexMap<String, Value>,
    ) -> Result<Value, ExtractError> {
        if self.config.cyclic {
            if let Some(identity) = value.identity() {
                if let Some(back) = self.back_reference(identity, value, path) {
                    let id = reference_id(CYCLIC_PREFIX, path);
                    trace!(id = %id, "back reference");
                    references.insert(id.clone(), back);
                    return Ok(Value::String(id));
                }
            }
        }

        if let Some(prefix) = self.matching_prefix(value) {
            let id = reference_id(prefix, path);
            trace!(id = %id, kind = value.type_name(), "extracted reference");
            references.insert(id.clone(), value.clone());
            return Ok(Value::String(id));
        }

        let recurse = match value {
            Value::Object(_) => true,
            Value::Array(_) => self.config.recurse_arrays,
            _ => false,
        };
        if !recurse || !self.config.depth.allows(level) {
            return Ok(value.clone());
        }

        let identity = value.identity().unwrap_or_default();
        if ancestors.contains(&identity) {
            return Err(ExtractError::Cycle {
                path: join_path(path),
            });
        }
        ancestors.push(identity);
        let mut rebuilt = Vec::new();
        for (key, child) in value.entries() {
            path.push(key.clone());
            let replaced = self.visit(&child, level + 1, path, ancestors, references);
            path.pop();
            rebuilt.push((key, replaced?));
        }
        ancestors.pop();

        Ok(match value {
            Value::Array(_) => Value::array(rebuilt.into_iter().map(|(_, v)| v)),
            _ => Value::object(rebuilt),
        })
    }

    /// Back reference for an identity already in the arena, registering it otherwise.
    fn back_reference(&mut self, identity: usize, value: &Value, path: &[String]) -> Option<Value> {
        match self.index.get(&identity) {
            Some(&slot) => {
                let slot = &self.arena[slot];
                if slot.walk == self.walk {
                    Some(Value::String(slot.path.clone()))
                } else {
                    Some(slot.value.clone())
                }
            }
            None => {
                self.index.insert(identity, self.arena.len());
                self.arena.push(Slot {
                    value: value.clone(),
                    walk: self.walk,
                    path: join_path(path),
                });
                None
            }
        }
    }

    fn matching_prefix(&self, value: &Value) -> Option<char> {
        self.matchers
            .iter()
            .find(|(_, matcher)| matcher(value))
            .map(|(prefix, _)| *prefix)
    }

    /// Write every reference back into `replaced`, in map order.
    ///
    /// `c` entries holding a string resolve that path against the merged root,
    /// so self references come back identity-equal.
    pub fn merge(
        &self,
        replaced: Value,
        references: &IndexMap<String, Value>,
    ) -> Result<Value, ExtractError> {
        let mut root = replaced;
        for (id, value) in references {
            let (prefix, segments) = parse_reference_id(id)?;
            let value = match (prefix, value) {
                (CYCLIC_PREFIX, Value::String(target)) => {
                    resolve(&root, &split_path(target)).ok_or_else(|| ExtractError::InvalidPath {
                        id: id.clone(),
                        path: target.clone(),
                    })?
                }
                _ => value.clone(),
            };
            match segments.split_last() {
                None => root = value,
                Some((last, parents)) => {
                    let invalid = || ExtractError::InvalidPath {
                        id: id.clone(),
                        path: join_path(&segments),
                    };
                    let parent = resolve(&root, parents).ok_or_else(invalid)?;
                    parent.set(last, value).map_err(|_| invalid())?;
                }
            }
        }
        Ok(root)
    }

    /// Release the identity arena and every registered matcher.
    pub fn destroy(&mut self) {
        debug!(tracked = self.arena.len(), "destroying extractor");
        self.arena.clear();
        self.index.clear();
        self.matchers.clear();
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(ExtractorConfig::default())
    }
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extractor")
            .field("config", &self.config)
            .field("prefixes", &self.prefixes())
            .field("tracked", &self.arena.len())
            .finish()
    }
}

fn resolve(root: &Value, segments: &[String]) -> Option<Value> {
    segments
        .iter()
        .try_fold(root.clone(), |current, segment| current.get(segment))
}

/// `<prefix>-<escaped.path>`, or the bare prefix for the root.
pub fn reference_id(prefix: char, path: &[String]) -> String {
    if path.is_empty() {
        prefix.to_string()
    } else {
        format!("{}-{}", prefix, join_path(path))
    }
}

/// Split an id into its prefix and unescaped path segments.
pub fn parse_reference_id(id: &str) -> Result<(char, Vec<String>), ExtractError> {
    let mut chars = id.chars();
    let prefix = chars
        .next()
        .ok_or_else(|| ExtractError::MalformedId(id.to_string()))?;
    let rest = chars.as_str();
    if rest.is_empty() {
        return Ok((prefix, Vec::new()));
    }
    match rest.strip_prefix('-') {
        // a single empty key
        Some("") => Ok((prefix, vec![String::new()])),
        Some(path) => Ok((prefix, split_path(path))),
        None => Err(ExtractError::MalformedId(id.to_string())),
    }
}

pub fn join_path(segments: &[String]) -> String {
    segments
        .iter()
        .map(|segment| segment.replace('\\', "\\\\").replace('.', "\\."))
        .collect::<Vec<_>>()
        .join(".")
}

pub fn split_path(path: &str) -> Vec<String> {
    if path.is_empty() {
        return Vec::new();
    }
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '.' => segments.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    segments.push(current);
    segments
}
