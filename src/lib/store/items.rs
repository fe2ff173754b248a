use std::{fmt, sync::Arc};

use tracing::trace;

use super::Shared;
use crate::{
    codec::{ValueEntries, key_stem},
    compile::CompiledSorter,
    env::ReadTxn,
    error::Result,
    expression::{Generator, Selection},
    key::Key,
    val::Val,
};

/// Lists never buffer fewer than this many items before sorting and
/// trimming.
const MIN_BUFFER: usize = 1000;

/// A key in its stored form, as handed out with each item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawKey(Vec<u8>);

impl RawKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One row of a result set.
#[derive(Clone)]
pub struct Item {
    raw_key: RawKey,
    key: Key,
    generators: Vec<Option<Generator>>,
    store: Arc<Shared>,
}

impl Item {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn raw_key(&self) -> &RawKey {
        &self.raw_key
    }

    pub fn generators(&self) -> &[Option<Generator>] {
        &self.generators
    }

    /// Value of the field at `index`. Selectors on a group are resolved
    /// against its ordered children; every other generator evaluates
    /// directly.
    pub fn value(&self, index: usize) -> Result<Val> {
        let Some(generator) = self.generators.get(index).and_then(Option::as_ref) else {
            return Ok(Val::Null);
        };
        let Some(spec) = generator.selector() else {
            return Ok(generator.eval());
        };
        if self.key.is_root() || !self.key.is_grouped() {
            return Ok(generator.eval());
        }

        let child_depth = self.key.child_depth();
        if child_depth > self.store.compiled.depths().max_depth() {
            return Ok(generator.eval());
        }

        let store = &self.store;
        let parent = self.raw_key.as_bytes();
        let children = store.env.with_read_txn(&store.cancel, |txn| {
            children(
                store,
                txn,
                &self.key,
                parent,
                spec.limit,
                spec.sort,
                spec.trim_top,
            )
        })?;
        if children.is_empty() {
            return Ok(generator.eval());
        }
        Ok(generator.select(&ChildSelection {
            children: &children,
            index,
        }))
    }

    pub fn values(&self) -> Result<Vec<Val>> {
        (0..self.generators.len())
            .map(|index| self.value(index))
            .collect()
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("key", &self.key)
            .field("generators", &self.generators)
            .finish()
    }
}

/// The sorted, trimmed children of one key.
#[derive(Debug, Clone, Default)]
pub struct Items {
    items: Vec<Item>,
}

impl Items {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&Item> {
        self.items.get(position)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Item> {
        self.items.iter()
    }
}

impl IntoIterator for Items {
    type Item = Item;
    type IntoIter = std::vec::IntoIter<Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a Items {
    type Item = &'a Item;
    type IntoIter = std::slice::Iter<'a, Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

struct ChildSelection<'a> {
    children: &'a [Item],
    index: usize,
}

impl Selection for ChildSelection<'_> {
    fn size(&self) -> usize {
        self.children.len()
    }

    fn get(&self, position: usize) -> Val {
        self.children
            .get(position)
            .and_then(|child| child.generators.get(self.index))
            .and_then(Option::as_ref)
            .map(Generator::eval)
            .unwrap_or_default()
    }
}

pub(crate) trait HasGenerators {
    fn generators(&self) -> &[Option<Generator>];
}

impl HasGenerators for Item {
    fn generators(&self) -> &[Option<Generator>] {
        &self.generators
    }
}

/// Sorts `list` when a sorter is given, then keeps `limit` entries: the head,
/// or the tail when `trim_top` is set.
pub(crate) fn sort_and_trim<T: HasGenerators>(
    list: &mut Vec<T>,
    sorter: Option<&CompiledSorter>,
    limit: usize,
    trim_top: bool,
) {
    if let Some(sorter) = sorter {
        list.sort_by(|a, b| sorter.compare(a.generators(), b.generators()));
    }
    if list.len() > limit {
        if trim_top {
            let excess = list.len() - limit;
            list.drain(..excess);
        } else {
            list.truncate(limit);
        }
    }
}

/// Children of `parent`, whose serialised form is `parent_key_bytes`.
/// Without a sorter the scan stops as soon as `limit` items are held; with
/// one, the buffer is sorted and trimmed whenever it outgrows twice the
/// limit.
pub(crate) fn children(
    shared: &Arc<Shared>,
    txn: &ReadTxn<'_>,
    parent: &Key,
    parent_key_bytes: &[u8],
    limit: usize,
    allow_sort: bool,
    trim_top: bool,
) -> Result<Vec<Item>> {
    let depth = parent.child_depth();
    let stem = key_stem(depth, parent_key_bytes);
    let max_size = if limit >= usize::MAX / 2 {
        usize::MAX
    } else {
        limit.saturating_mul(2).max(MIN_BUFFER)
    };
    let sorter = if allow_sort {
        shared.compiled.sorter(depth)
    } else {
        None
    };

    let mut list: Vec<Item> = Vec::new();
    txn.scan_from(&shared.table, &stem, |key, value| {
        if !key.starts_with(&stem) {
            return Ok(false);
        }
        for entry in ValueEntries::new(value) {
            let entry = entry?;
            let key = shared.serialiser.to_key(entry.full_key)?;
            // Stems only carry a hash of the parent.
            if !is_child_of(&key, parent) {
                continue;
            }
            list.push(Item {
                raw_key: RawKey(entry.full_key.to_vec()),
                key,
                generators: shared.serialiser.read_generators(entry.generators)?,
                store: Arc::clone(shared),
            });
        }
        if sorter.is_some() || trim_top {
            if list.len() > max_size {
                sort_and_trim(&mut list, sorter, limit, trim_top);
            }
            Ok(true)
        } else {
            Ok(list.len() < limit)
        }
    })?;

    sort_and_trim(&mut list, sorter, limit, trim_top);
    trace!(depth, count = list.len(), "read children");
    Ok(list)
}

fn is_child_of(key: &Key, parent: &Key) -> bool {
    key.parts().len() == parent.parts().len() + 1 && key.parts().starts_with(parent.parts())
}

/// Children of `parent`, trimmed to the store's size for their depth.
pub(crate) fn get(shared: &Arc<Shared>, parent: &Key) -> Result<Items> {
    let child_depth = parent.child_depth();
    if shared.is_cleared()
        || child_depth > shared.compiled.depths().max_depth()
        || !parent.is_grouped()
    {
        return Ok(Items::default());
    }
    let parent_bytes = shared.serialiser.key_bytes(parent)?;
    let limit = shared.trimmed_sizes.size(child_depth);
    let items = shared.env.with_read_txn(&shared.cancel, |txn| {
        children(shared, txn, parent, &parent_bytes, limit, true, false)
    })?;
    Ok(Items { items })
}
