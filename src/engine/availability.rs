use crate::model::*;

// ── Interval merging ──────────────────────────────────────────────

/// Merge busy intervals from any source into sorted, disjoint blocks.
///
/// Intervals that overlap or touch coalesce. Each block lists every origin
/// that contributed to it, sorted and deduplicated, so the output does not
/// depend on input order.
pub fn merge(intervals: &[BusyInterval]) -> Vec<BusyBlock> {
    let mut sorted: Vec<&BusyInterval> = intervals.iter().collect();
    sorted.sort_by_key(|i| (i.span.start, i.span.end));

    let mut blocks: Vec<BusyBlock> = Vec::new();
    for interval in sorted {
        if let Some(last) = blocks.last_mut()
            && interval.span.start <= last.span.end
        {
            last.span.end = last.span.end.max(interval.span.end);
            last.sources.push((interval.origin, interval.level));
            continue;
        }
        blocks.push(BusyBlock {
            span: interval.span,
            sources: vec![(interval.origin, interval.level)],
        });
    }
    for block in &mut blocks {
        block.sources.sort();
        block.sources.dedup();
    }
    blocks
}

/// Merge sorted overlapping/adjacent spans into disjoint spans.
pub fn merge_spans(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start; `to_remove` may overlap itself.
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

/// Complement of the busy blocks inside `window`.
pub fn free_windows(window: Span, busy: &[BusyBlock]) -> Vec<Span> {
    let spans: Vec<Span> = busy.iter().map(|b| b.span).collect();
    subtract_intervals(&[window], &spans)
}

/// Clip every interval to `window`, dropping the ones outside it.
pub(super) fn clip_to(window: &Span, intervals: Vec<BusyInterval>) -> Vec<BusyInterval> {
    intervals
        .into_iter()
        .filter_map(|i| {
            i.span.intersection(window).map(|span| BusyInterval { span, ..i })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn busy(start: Ms, end: Ms, origin: BusyOrigin, level: EntityKind) -> BusyInterval {
        BusyInterval {
            span: Span::new(start, end),
            origin,
            level,
        }
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_partial_edges() {
        let base = vec![Span::new(100, 200)];
        assert_eq!(
            subtract_intervals(&base, &[Span::new(50, 150)]),
            vec![Span::new(150, 200)]
        );
        assert_eq!(
            subtract_intervals(&base, &[Span::new(150, 250)]),
            vec![Span::new(100, 150)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![
            Span::new(100, 200),
            Span::new(400, 500),
            Span::new(800, 900),
        ];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    // ── merge ────────────────────────────────────────────

    #[test]
    fn merge_spans_basic_and_adjacent() {
        let spans = vec![Span::new(100, 300), Span::new(200, 400), Span::new(500, 600)];
        assert_eq!(merge_spans(&spans), vec![Span::new(100, 400), Span::new(500, 600)]);
        let touching = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_spans(&touching), vec![Span::new(100, 300)]);
    }

    #[test]
    fn merge_attributes_every_origin() {
        let weekend = Ulid::new();
        let maintenance = Ulid::new();
        let booking = Ulid::new();
        let blocks = merge(&[
            busy(12 * H, 14 * H, BusyOrigin::Reservation(booking), EntityKind::Place),
            busy(9 * H, 12 * H, BusyOrigin::Blocking(weekend), EntityKind::Building),
            busy(10 * H, 11 * H, BusyOrigin::Blocking(maintenance), EntityKind::Area),
            busy(16 * H, 17 * H, BusyOrigin::Blocking(weekend), EntityKind::Building),
        ]);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].span, Span::new(9 * H, 14 * H));
        assert_eq!(blocks[0].sources.len(), 3);
        assert_eq!(blocks[1].span, Span::new(16 * H, 17 * H));
        assert_eq!(
            blocks[1].sources,
            vec![(BusyOrigin::Blocking(weekend), EntityKind::Building)]
        );
    }

    #[test]
    fn merge_deduplicates_repeated_origin() {
        let rule = Ulid::new();
        let blocks = merge(&[
            busy(0, 10, BusyOrigin::Blocking(rule), EntityKind::Area),
            busy(5, 20, BusyOrigin::Blocking(rule), EntityKind::Area),
        ]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].sources.len(), 1);
    }

    #[test]
    fn free_windows_complement() {
        let blocks = merge(&[
            busy(12 * H, 13 * H, BusyOrigin::Occurrence(0), EntityKind::Place),
        ]);
        assert_eq!(
            free_windows(Span::new(9 * H, 17 * H), &blocks),
            vec![Span::new(9 * H, 12 * H), Span::new(13 * H, 17 * H)]
        );
        assert_eq!(free_windows(Span::new(0, H), &[]), vec![Span::new(0, H)]);
    }

    #[test]
    fn clip_drops_and_trims() {
        let window = Span::new(100, 200);
        let clipped = clip_to(
            &window,
            vec![
                busy(50, 150, BusyOrigin::Occurrence(0), EntityKind::Place),
                busy(200, 300, BusyOrigin::Occurrence(1), EntityKind::Place),
            ],
        );
        assert_eq!(clipped.len(), 1);
        assert_eq!(clipped[0].span, Span::new(100, 150));
    }
}
