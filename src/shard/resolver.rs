//! Shard resolvers (spec.md §4.8): hash, range, lookup, and composite.
//!
//! A resolver is a (partial) function from a tuple of shard-key values to
//! a shard. `NULL` never participates in resolution (Open Question #3 in
//! SPEC_FULL.md) — a null shard-key value always raises
//! `MissingShardKeyError`, the same as an absent one.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

use crate::error::{OrmError, OrmResult};
use crate::value::Value;

pub type ShardId = String;

pub trait ShardResolver: Send + Sync + std::fmt::Debug {
    /// Columns this resolver needs present (and non-null) in the keys map.
    fn required_columns(&self) -> &[String];

    fn resolve(&self, keys: &HashMap<String, Value>) -> OrmResult<ShardId>;

    /// All shards this resolver could ever produce, for `shards_for`.
    fn all_shards(&self) -> Vec<ShardId>;
}

fn require<'a>(keys: &'a HashMap<String, Value>, column: &str, model: &str) -> OrmResult<&'a Value> {
    match keys.get(column) {
        Some(v) if !v.is_null() => Ok(v),
        _ => Err(OrmError::MissingShardKeyError {
            model: model.to_string(),
            columns: vec![column.to_string()],
        }),
    }
}

/// `shard_index = stable_hash(concat(key_i)) mod N`, named `{prefix}_{i}`.
/// Uses fixed `ahash` seeds so the hash is identical across processes
/// (the standard library's default hasher is explicitly randomized and
/// unsuitable here).
#[derive(Debug)]
pub struct HashResolver {
    pub model: String,
    pub columns: Vec<String>,
    pub prefix: String,
    pub num_shards: usize,
}

const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x5151_5151_5151_5151,
    0x5252_5252_5252_5252,
    0x5353_5353_5353_5353,
    0x5454_5454_5454_5454,
);

impl HashResolver {
    pub fn new(model: impl Into<String>, columns: Vec<String>, prefix: impl Into<String>, num_shards: usize) -> Self {
        Self {
            model: model.into(),
            columns,
            prefix: prefix.into(),
            num_shards,
        }
    }

    fn stable_hash(&self, parts: &[&Value]) -> u64 {
        let (k0, k1, k2, k3) = HASH_SEEDS;
        let build = ahash::RandomState::with_seeds(k0, k1, k2, k3);
        let mut hasher = build.build_hasher();
        for value in parts {
            value.to_string().hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl ShardResolver for HashResolver {
    fn required_columns(&self) -> &[String] {
        &self.columns
    }

    fn resolve(&self, keys: &HashMap<String, Value>) -> OrmResult<ShardId> {
        let values: Vec<&Value> = self
            .columns
            .iter()
            .map(|c| require(keys, c, &self.model))
            .collect::<OrmResult<_>>()?;
        let hash = self.stable_hash(&values);
        let index = (hash % self.num_shards as u64) as usize;
        Ok(format!("{}_{}", self.prefix, index))
    }

    fn all_shards(&self) -> Vec<ShardId> {
        (0..self.num_shards).map(|i| format!("{}_{}", self.prefix, i)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct RangeBound {
    pub lower: Value,
    pub upper: Value,
    pub shard: ShardId,
}

/// Ordered, non-overlapping, non-gapped ranges over a single
/// totally-ordered key. Overlap/gap checking happens once, at
/// registration time.
#[derive(Debug)]
pub struct RangeResolver {
    pub model: String,
    pub column: String,
    ranges: Vec<RangeBound>,
}

impl RangeResolver {
    pub fn new(model: impl Into<String>, column: impl Into<String>, mut ranges: Vec<RangeBound>) -> OrmResult<Self> {
        ranges.sort_by(|a, b| a.lower.partial_cmp(&b.lower).expect("range bounds must be comparable"));
        for pair in ranges.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.upper > b.lower {
                return Err(OrmError::ShardRangeConflict(format!(
                    "range for shard {} overlaps range for shard {}",
                    a.shard, b.shard
                )));
            }
            if a.upper < b.lower {
                return Err(OrmError::ShardRangeConflict(format!(
                    "gap between range for shard {} and shard {}",
                    a.shard, b.shard
                )));
            }
        }
        Ok(Self {
            model: model.into(),
            column: column.into(),
            ranges,
        })
    }
}

impl ShardResolver for RangeResolver {
    fn required_columns(&self) -> &[String] {
        std::slice::from_ref(&self.column)
    }

    fn resolve(&self, keys: &HashMap<String, Value>) -> OrmResult<ShardId> {
        let value = require(keys, &self.column, &self.model)?;
        let idx = self
            .ranges
            .binary_search_by(|range| {
                if value < &range.lower {
                    std::cmp::Ordering::Greater
                } else if value >= &range.upper {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .map_err(|_| OrmError::NoRangeForValue(value.to_string()))?;
        Ok(self.ranges[idx].shard.clone())
    }

    fn all_shards(&self) -> Vec<ShardId> {
        self.ranges.iter().map(|r| r.shard.clone()).collect()
    }
}

/// Maps a categorical key (country, region, tenant) to a shard.
#[derive(Debug)]
pub struct LookupResolver {
    pub model: String,
    pub column: String,
    pub mapping: HashMap<String, ShardId>,
    pub default_shard: Option<ShardId>,
}

impl LookupResolver {
    pub fn new(
        model: impl Into<String>,
        column: impl Into<String>,
        mapping: HashMap<String, ShardId>,
        default_shard: Option<ShardId>,
    ) -> Self {
        Self {
            model: model.into(),
            column: column.into(),
            mapping,
            default_shard,
        }
    }
}

impl ShardResolver for LookupResolver {
    fn required_columns(&self) -> &[String] {
        std::slice::from_ref(&self.column)
    }

    fn resolve(&self, keys: &HashMap<String, Value>) -> OrmResult<ShardId> {
        let value = require(keys, &self.column, &self.model)?;
        let key = value.to_string();
        self.mapping
            .get(&key)
            .cloned()
            .or_else(|| self.default_shard.clone())
            .ok_or_else(|| OrmError::NoShardForValue {
                model: self.model.clone(),
                value: key,
            })
    }

    fn all_shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.mapping.values().cloned().collect();
        shards.extend(self.default_shard.clone());
        shards.sort();
        shards.dedup();
        shards
    }
}

/// A sequence of resolvers; the first whose required keys are all present
/// (and non-null) wins.
#[derive(Debug)]
pub struct CompositeResolver {
    pub model: String,
    pub resolvers: Vec<Box<dyn ShardResolver>>,
}

impl CompositeResolver {
    pub fn new(model: impl Into<String>, resolvers: Vec<Box<dyn ShardResolver>>) -> Self {
        Self {
            model: model.into(),
            resolvers,
        }
    }
}

impl ShardResolver for CompositeResolver {
    fn required_columns(&self) -> &[String] {
        self.resolvers.first().map(|r| r.required_columns()).unwrap_or(&[])
    }

    fn resolve(&self, keys: &HashMap<String, Value>) -> OrmResult<ShardId> {
        for resolver in &self.resolvers {
            let has_all = resolver
                .required_columns()
                .iter()
                .all(|c| keys.get(c).map(|v| !v.is_null()).unwrap_or(false));
            if has_all {
                return resolver.resolve(keys);
            }
        }
        Err(OrmError::MissingShardKeyError {
            model: self.model.clone(),
            columns: self
                .resolvers
                .iter()
                .flat_map(|r| r.required_columns().to_vec())
                .collect(),
        })
    }

    fn all_shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.resolvers.iter().flat_map(|r| r.all_shards()).collect();
        shards.sort();
        shards.dedup();
        shards
    }
}
