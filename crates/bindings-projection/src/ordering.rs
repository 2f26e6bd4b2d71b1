//! Slot-preserving sort
//!
//! Only entries the engine injected are reordered, and only among the
//! positions they already occupy. Everything else keeps its index.

/// Sort the entries selected by `is_injected` by `key`, leaving all other
/// entries where they are.
///
/// The sort is stable, so equal keys keep their relative order.
pub fn sort_injected<T, K, P, F>(items: &mut [T], is_injected: P, key: F)
where
    T: Clone,
    K: Ord,
    P: Fn(&T) -> bool,
    F: Fn(&T) -> K,
{
    let slots: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| is_injected(item))
        .map(|(i, _)| i)
        .collect();
    if slots.len() < 2 {
        return;
    }

    let mut injected: Vec<T> = slots.iter().map(|&i| items[i].clone()).collect();
    injected.sort_by(|a, b| key(a).cmp(&key(b)));
    for (slot, item) in slots.into_iter().zip(injected) {
        items[slot] = item;
    }
}
