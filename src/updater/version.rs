use std::cmp::Ordering;

/// Whether `remote` is a strictly newer dotted version than `local`.
///
/// Components are compared numerically left to right. Missing or non-numeric
/// components count as `0`, so `"1.0"` equals `"1"` and `"1.x"` equals
/// `"1.0"`. Pre-release and build suffixes get no special treatment.
pub fn is_newer(remote: &str, local: &str) -> bool {
    compare_dotted(remote, local) == Ordering::Greater
}

fn compare_dotted(left: &str, right: &str) -> Ordering {
    let left: Vec<u64> = left.split('.').map(component).collect();
    let right: Vec<u64> = right.split('.').map(component).collect();
    let len = left.len().max(right.len());
    (0..len)
        .map(|idx| {
            let l = left.get(idx).copied().unwrap_or(0);
            let r = right.get(idx).copied().unwrap_or(0);
            l.cmp(&r)
        })
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn component(part: &str) -> u64 {
    part.parse().unwrap_or(0)
}
