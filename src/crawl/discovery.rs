//! Last-page discovery for listings that never say where results end.
//!
//! Entry counts are assumed non-increasing past the real bound. Doubling
//! brackets the bound between a page with entries and an empty page, then a
//! binary search narrows it. A page with entries is only accepted as the bound
//! once the `lookahead` pages after it are all empty, so one spuriously empty
//! page does not cut the crawl short.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

/// Answers "how many entries are on page N".
#[async_trait]
pub trait PageCounter: Send {
    async fn count(&mut self, page: u32) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovery {
    /// Highest page with entries; 0 when page 1 is already empty.
    pub last_page: u32,
    /// Distinct pages fetched.
    pub probes: u32,
}

struct Probe<'a, C: PageCounter + ?Sized> {
    counter: &'a mut C,
    seen: HashMap<u32, usize>,
}

impl<C: PageCounter + ?Sized> Probe<'_, C> {
    async fn has_entries(&mut self, page: u32) -> bool {
        if let Some(n) = self.seen.get(&page) {
            return *n > 0;
        }
        let n = self.counter.count(page).await;
        debug!(page, entries = n, "probe");
        self.seen.insert(page, n);
        n > 0
    }
}

pub async fn discover<C: PageCounter + ?Sized>(
    counter: &mut C,
    max_page: u32,
    lookahead: u32,
    hint: Option<u32>,
) -> Discovery {
    let max_page = max_page.max(1);
    let lookahead = lookahead.max(1);
    let mut probe = Probe {
        counter,
        seen: HashMap::new(),
    };

    let last_page = search(&mut probe, max_page, lookahead, hint).await;
    Discovery {
        last_page,
        probes: probe.seen.len() as u32,
    }
}

async fn search<C: PageCounter + ?Sized>(
    probe: &mut Probe<'_, C>,
    max_page: u32,
    lookahead: u32,
    hint: Option<u32>,
) -> u32 {
    // Doubling: `low` has entries, `empty` has none.
    let hint = hint.map(|h| h.clamp(1, max_page)).filter(|h| *h > 1);
    let (mut low, mut empty) = match hint {
        Some(h) if probe.has_entries(h).await => (h, None),
        Some(h) => {
            if !probe.has_entries(1).await {
                return 0;
            }
            (1, Some(h))
        }
        None => {
            if !probe.has_entries(1).await {
                return 0;
            }
            (1, None)
        }
    };

    let first_empty = loop {
        if let Some(e) = empty {
            break e;
        }
        if low == max_page {
            return max_page;
        }
        let next = low.saturating_mul(2).min(max_page);
        if probe.has_entries(next).await {
            low = next;
        } else {
            empty = Some(next);
        }
    };

    // Binary search over [low, high]; `low` always has entries.
    let mut high = first_empty - 1;
    while low <= high {
        let mid = low + (high - low) / 2;
        if !probe.has_entries(mid).await {
            high = mid - 1;
            continue;
        }
        let last_ahead = mid.saturating_add(lookahead).min(max_page);
        let mut next_full = None;
        for p in mid + 1..=last_ahead {
            if probe.has_entries(p).await {
                next_full = Some(p);
                break;
            }
        }
        match next_full {
            Some(p) => low = p,
            None => return mid,
        }
    }
    low
}
