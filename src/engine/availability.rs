use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Windows within `query` where at least one of the lot's slots is
/// open: the query window minus the spans where every slot is busy at
/// once. Busy means an active (end > now) booking, clamped to the
/// window; the per-slot cached status plays no part here.
pub fn free_windows(lot: &LotState, query: &Span, now: Ms) -> Vec<Span> {
    let mut busy: Vec<Span> = Vec::new();
    for slot in &lot.slots {
        for b in slot.overlapping(query) {
            if b.span.end > now {
                busy.push(Span::new(
                    b.span.start.max(query.start),
                    b.span.end.min(query.end),
                ));
            }
        }
    }
    busy.sort_by_key(|s| s.start);

    let saturated = saturated_spans(&busy, lot.capacity);
    if saturated.is_empty() {
        return vec![*query];
    }
    subtract_intervals(&[*query], &saturated)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Subtract `to_remove` (sorted) from `base` (sorted, disjoint).
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Sweep line: time ranges where at least `capacity` of the given
/// spans are live simultaneously, i.e. every slot is taken.
/// Returns sorted, merged spans.
pub fn saturated_spans(busy: &[Span], capacity: u32) -> Vec<Span> {
    if busy.is_empty() || capacity == 0 {
        return Vec::new();
    }
    if capacity == 1 {
        return merge_overlapping(busy);
    }

    // +1 at start, -1 at end
    let mut events: Vec<(Ms, i32)> = Vec::with_capacity(busy.len() * 2);
    for b in busy {
        events.push((b.start, 1));
        events.push((b.end, -1));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result = Vec::new();
    let mut count: u32 = 0;
    let mut saturated_start: Option<Ms> = None;

    for (time, delta) in &events {
        if *delta > 0 {
            count += *delta as u32;
        } else {
            count -= (-*delta) as u32;
        }

        if count >= capacity && saturated_start.is_none() {
            saturated_start = Some(*time);
        } else if count < capacity
            && let Some(start) = saturated_start.take()
            && *time > start {
                result.push(Span::new(start, *time));
            }
    }

    merge_overlapping(&result)
}
