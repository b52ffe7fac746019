//! Extent mapping: disjoint sector intervals to physical locations.
//!
//! An [`ExtentMap`] maps half-open intervals `[base, limit)` of virtual
//! sectors to values describing where those sectors live: an object and
//! offset within it for the translation layer, or a plain sector address for
//! the journal's forward (`vLBA -> pLBA`) and reverse (`pLBA -> vLBA`) maps.
//!
//! Values are *shiftable*: splitting an interval must advance the physical
//! location of the right-hand piece by the split distance, so [`ExtentValue`]
//! carries that arithmetic. Updates overwrite any overlapping range,
//! splitting partial overlaps and optionally reporting the displaced pieces;
//! adjacent intervals whose values are sequentially continuous coalesce.
//!
//! Invariants: intervals are disjoint, empty intervals are never stored.

use std::collections::BTreeMap;

/// A value an extent map can store.
///
/// `shift(n)` returns the location `n` sectors further into the same
/// physical placement; it is how split-off right-hand pieces stay correct.
pub trait ExtentValue: Copy + Eq {
    /// The location `sectors` past `self`
    fn shift(self, sectors: u64) -> Self;
}

/// Plain sector addresses (journal forward/reverse maps)
impl ExtentValue for u64 {
    fn shift(self, sectors: u64) -> Self {
        self + sectors
    }
}

/// A location inside a numbered backend object, in sectors from the start of
/// the object (header included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjExtent {
    /// Backend object sequence number
    pub obj: u32,
    /// Sector offset within the object
    pub offset: u64,
}

impl ExtentValue for ObjExtent {
    fn shift(self, sectors: u64) -> Self {
        Self {
            obj: self.obj,
            offset: self.offset + sectors,
        }
    }
}

/// One mapped interval: sectors `[base, limit)` live at `value`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent<V> {
    pub base: u64,
    pub limit: u64,
    pub value: V,
}

impl<V> Extent<V> {
    /// Interval length in sectors
    pub fn len(&self) -> u64 {
        self.limit - self.base
    }

    pub fn is_empty(&self) -> bool {
        self.limit <= self.base
    }
}

/// Ordered map from disjoint sector intervals to shiftable values
#[derive(Debug, Clone, Default)]
pub struct ExtentMap<V> {
    // base -> (limit, value)
    entries: BTreeMap<u64, (u64, V)>,
}

impl<V: ExtentValue> ExtentMap<V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Number of stored intervals
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all mappings
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// The interval containing `sector`, or the next interval above it
    pub fn lookup(&self, sector: u64) -> Option<Extent<V>> {
        if let Some((&base, &(limit, value))) = self.entries.range(..=sector).next_back() {
            if limit > sector {
                return Some(Extent { base, limit, value });
            }
        }
        self.entries
            .range(sector + 1..)
            .next()
            .map(|(&base, &(limit, value))| Extent { base, limit, value })
    }

    /// All intervals overlapping `[base, limit)`, clamped to it, with values
    /// shifted to match the clamped base.
    pub fn overlapping(&self, base: u64, limit: u64) -> Vec<Extent<V>> {
        let mut out = Vec::new();
        if base >= limit {
            return out;
        }
        // The entry straddling `base`, if any.
        if let Some((&eb, &(el, v))) = self.entries.range(..base).next_back() {
            if el > base {
                out.push(Extent {
                    base,
                    limit: el.min(limit),
                    value: v.shift(base - eb),
                });
            }
        }
        for (&eb, &(el, v)) in self.entries.range(base..limit) {
            out.push(Extent {
                base: eb,
                limit: el.min(limit),
                value: v,
            });
        }
        out
    }

    /// In-order iteration over all intervals
    pub fn iter(&self) -> impl Iterator<Item = Extent<V>> + '_ {
        self.entries.iter().map(|(&base, &(limit, value))| Extent {
            base,
            limit,
            value,
        })
    }

    /// Map `[base, limit)` to `value`, overwriting any overlap.
    pub fn update(&mut self, base: u64, limit: u64, value: V) {
        self.update_displaced(base, limit, value, &mut Vec::new());
    }

    /// Map `[base, limit)` to `value`, overwriting any overlap and pushing
    /// the displaced old pieces (clamped, values shifted) onto `displaced`.
    pub fn update_displaced(
        &mut self,
        base: u64,
        limit: u64,
        value: V,
        displaced: &mut Vec<Extent<V>>,
    ) {
        if base >= limit {
            return;
        }
        self.carve(base, limit, Some(displaced));

        // Insert, coalescing with sequentially-continuous neighbors.
        let mut new_base = base;
        let mut new_limit = limit;
        let mut new_value = value;
        if let Some((&lb, &(ll, lv))) = self.entries.range(..base).next_back() {
            if ll == base && lv.shift(base - lb) == value {
                self.entries.remove(&lb);
                new_base = lb;
                new_value = lv;
            }
        }
        if let Some((&rb, &(rl, rv))) = self.entries.range(limit..).next() {
            if rb == limit && new_value.shift(limit - new_base) == rv {
                self.entries.remove(&rb);
                new_limit = rl;
            }
        }
        self.entries.insert(new_base, (new_limit, new_value));
    }

    /// Remove all mappings within `[base, limit)`, splitting partial overlaps
    pub fn trim(&mut self, base: u64, limit: u64) {
        if base >= limit {
            return;
        }
        self.carve(base, limit, None);
    }

    /// Clear `[base, limit)` out of the map, keeping pieces outside the range
    /// and optionally reporting the removed pieces.
    fn carve(&mut self, base: u64, limit: u64, mut displaced: Option<&mut Vec<Extent<V>>>) {
        // Left-straddling entry: keep [eb, base), maybe keep [limit, el).
        if let Some((&eb, &(el, v))) = self.entries.range(..base).next_back() {
            if el > base {
                self.entries.insert(eb, (base, v));
                if let Some(d) = displaced.as_deref_mut() {
                    d.push(Extent {
                        base,
                        limit: el.min(limit),
                        value: v.shift(base - eb),
                    });
                }
                if el > limit {
                    self.entries.insert(limit, (el, v.shift(limit - eb)));
                    return; // fully contained the carve range
                }
            }
        }
        // Entries starting inside the range.
        let starts: Vec<u64> = self.entries.range(base..limit).map(|(&b, _)| b).collect();
        for eb in starts {
            let (el, v) = self.entries.remove(&eb).expect("entry vanished");
            if let Some(d) = displaced.as_deref_mut() {
                d.push(Extent {
                    base: eb,
                    limit: el.min(limit),
                    value: v,
                });
            }
            if el > limit {
                self.entries.insert(limit, (el, v.shift(limit - eb)));
            }
        }
    }
}
