//! Generation-scoped element refs (`@e1`, `@e2`, ...).
//!
//! Every snapshot installs a fresh [`RefMap`] under a new generation. String
//! refs resolve against whatever generation is current; typed [`Ref`]s carry
//! the generation that minted them and go stale as soon as it is replaced.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::browser::ElementHandle;
use crate::error::{PagewrightError, Result};

/// Textual prefix shared by every ref id.
pub const REF_PREFIX: &str = "@e";

/// A ref minted by one snapshot generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Ref {
    pub index: u32,
    pub generation: u64,
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", REF_PREFIX, self.index)
    }
}

/// Parse `@e<digits>` into its index. Anything else is not a ref and
/// should be treated as a CSS selector.
pub fn parse_ref(input: &str) -> Option<u32> {
    let digits = input.trim().strip_prefix(REF_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Overlong digit runs are still refs, just ones that were never minted.
    Some(digits.parse().unwrap_or(u32::MAX))
}

/// Immutable ref table of one generation; `handles[i]` backs `@e{i+1}`.
#[derive(Debug, Default)]
pub struct RefMap {
    generation: u64,
    handles: Vec<ElementHandle>,
}

impl RefMap {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<ElementHandle> {
        let slot = usize::try_from(index).ok()?.checked_sub(1)?;
        self.handles.get(slot).copied()
    }

    pub fn refs(&self) -> impl Iterator<Item = Ref> + '_ {
        (1..=self.handles.len()).map(move |i| Ref {
            index: i as u32,
            generation: self.generation,
        })
    }
}

#[derive(Debug)]
struct Inner {
    current: Arc<RefMap>,
    /// Largest index ever minted on this page, across all generations.
    high_water: u32,
}

/// Per-page registry; written only by the snapshot engine, read by the resolver.
#[derive(Debug)]
pub struct RefRegistry {
    inner: RwLock<Inner>,
}

impl Default for RefRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RefRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                current: Arc::new(RefMap::default()),
                high_water: 0,
            }),
        }
    }

    /// Generation of the active map; 0 before the first snapshot.
    pub fn generation(&self) -> u64 {
        self.inner.read().current.generation
    }

    pub fn current(&self) -> Arc<RefMap> {
        self.inner.read().current.clone()
    }

    /// Replace the active map wholesale with a new generation.
    pub fn install(&self, handles: Vec<ElementHandle>) -> Arc<RefMap> {
        let mut inner = self.inner.write();
        let map = Arc::new(RefMap {
            generation: inner.current.generation + 1,
            handles,
        });
        inner.high_water = inner.high_water.max(map.handles.len() as u32);
        inner.current = map.clone();
        map
    }

    /// Resolve `@eN` against the current generation.
    pub fn lookup(&self, ref_id: &str) -> Result<ElementHandle> {
        let index =
            parse_ref(ref_id).ok_or_else(|| PagewrightError::RefNotFound(ref_id.to_string()))?;

        let inner = self.inner.read();
        if let Some(handle) = inner.current.get(index) {
            return Ok(handle);
        }
        if index >= 1 && index <= inner.high_water {
            return Err(PagewrightError::RefStale {
                ref_id: ref_id.to_string(),
                current: inner.current.generation,
            });
        }
        Err(PagewrightError::RefNotFound(ref_id.to_string()))
    }

    /// Resolve a typed ref; only valid within the generation that minted it.
    pub fn lookup_ref(&self, r: Ref) -> Result<ElementHandle> {
        let inner = self.inner.read();
        let current = inner.current.generation;
        if r.generation < current {
            return Err(PagewrightError::RefStale {
                ref_id: r.to_string(),
                current,
            });
        }
        if r.generation > current {
            return Err(PagewrightError::RefNotFound(r.to_string()));
        }
        inner
            .current
            .get(r.index)
            .ok_or_else(|| PagewrightError::RefNotFound(r.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handles(ids: &[i64]) -> Vec<ElementHandle> {
        ids.iter().copied().map(ElementHandle).collect()
    }

    #[test]
    fn parse_ref_accepts_only_prefixed_digits() {
        assert_eq!(parse_ref("@e1"), Some(1));
        assert_eq!(parse_ref("@e42"), Some(42));
        assert_eq!(parse_ref("@e0"), Some(0));
        assert_eq!(parse_ref("@e"), None);
        assert_eq!(parse_ref("@e1a"), None);
        assert_eq!(parse_ref("e1"), None);
        assert_eq!(parse_ref("a.item"), None);
    }

    #[test]
    fn lookup_before_any_snapshot_is_not_found() {
        let registry = RefRegistry::new();
        assert!(matches!(
            registry.lookup("@e1"),
            Err(PagewrightError::RefNotFound(_))
        ));
    }

    #[test]
    fn install_bumps_generation_and_numbers_from_one() {
        let registry = RefRegistry::new();
        let map = registry.install(handles(&[10, 20]));

        assert_eq!(map.generation(), 1);
        assert_eq!(registry.lookup("@e1").unwrap(), ElementHandle(10));
        assert_eq!(registry.lookup("@e2").unwrap(), ElementHandle(20));
        assert!(matches!(
            registry.lookup("@e0"),
            Err(PagewrightError::RefNotFound(_))
        ));
        assert!(matches!(
            registry.lookup("@e3"),
            Err(PagewrightError::RefNotFound(_))
        ));
    }

    #[test]
    fn ids_missing_from_newer_generation_are_stale() {
        let registry = RefRegistry::new();
        registry.install(handles(&[1, 2, 3]));
        registry.install(handles(&[1]));

        assert!(matches!(
            registry.lookup("@e3"),
            Err(PagewrightError::RefStale { current: 2, .. })
        ));
        assert!(matches!(
            registry.lookup("@e4"),
            Err(PagewrightError::RefNotFound(_))
        ));
    }

    #[test]
    fn typed_refs_expire_with_their_generation() {
        let registry = RefRegistry::new();
        let first = registry.install(handles(&[7]));
        let r = first.refs().next().unwrap();

        assert_eq!(registry.lookup_ref(r).unwrap(), ElementHandle(7));

        registry.install(handles(&[7]));
        assert!(matches!(
            registry.lookup_ref(r),
            Err(PagewrightError::RefStale { .. })
        ));
        assert_eq!(registry.lookup("@e1").unwrap(), ElementHandle(7));
    }
}
