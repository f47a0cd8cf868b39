//! Dimension-subset fan-out
//!
//! Turns one fact into one derived fact per combination of its dimensions so
//! that "total", "per source", "per source + protocol", ... are each tracked
//! as their own series without bespoke code per combination.

use crate::fact::{Dimensions, Fact};
use std::collections::BTreeSet;

/// Expands facts into bounded dimension subsets
#[derive(Debug, Clone)]
pub struct DimensionExpander {
    required: BTreeSet<String>,
    max_subset_size: usize,
}

impl DimensionExpander {
    pub fn new<I, S>(required: I, max_subset_size: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            max_subset_size,
        }
    }

    pub fn required(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn max_subset_size(&self) -> usize {
        self.max_subset_size
    }

    /// One fact per subset of the non-required dimensions (size at most
    /// `max_subset_size`, the empty subset included), each merged with
    /// whichever required dimensions the fact carries.
    pub fn expand(&self, fact: &Fact) -> Vec<Fact> {
        let (required, optional): (Dimensions, Dimensions) = fact
            .dimensions()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .partition(|(k, _)| self.required.contains(k));

        all_subsets(&optional, self.max_subset_size)
            .into_iter()
            .map(|mut subset| {
                subset.extend(required.iter().map(|(k, v)| (k.clone(), v.clone())));
                Fact::from_dimensions(fact.timestamp, subset)
            })
            .collect()
    }
}

/// All subsets of `original` with at most `max_subset_size` entries.
///
/// Built incrementally: for each dimension, every existing subset still below
/// the limit is cloned with the dimension added, then the singleton is added.
/// The empty subset comes last.
pub fn all_subsets(original: &Dimensions, max_subset_size: usize) -> Vec<Dimensions> {
    let mut subsets: Vec<Dimensions> = Vec::new();

    for (name, value) in original {
        let extended: Vec<Dimensions> = subsets
            .iter()
            .filter(|subset| subset.len() < max_subset_size)
            .map(|subset| {
                let mut copy = subset.clone();
                copy.insert(name.clone(), value.clone());
                copy
            })
            .collect();
        subsets.extend(extended);

        if max_subset_size > 0 {
            let mut single = Dimensions::new();
            single.insert(name.clone(), value.clone());
            subsets.push(single);
        }
    }

    subsets.push(Dimensions::new());
    subsets
}
