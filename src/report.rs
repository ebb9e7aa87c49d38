use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{Movement, RankEntry, ScopeKey};

/// Students who moved furthest since the previous period, climbers first.
pub fn biggest_movers(entries: &[RankEntry], limit: usize) -> Vec<&RankEntry> {
    let mut movers: Vec<&RankEntry> = entries
        .iter()
        .filter(|entry| matches!(entry.movement, Movement::Delta(delta) if delta != 0))
        .collect();
    movers.sort_by(|a, b| {
        let magnitude = |entry: &RankEntry| match entry.movement {
            Movement::Delta(delta) => delta.abs(),
            Movement::New => 0,
        };
        magnitude(b)
            .cmp(&magnitude(a))
            .then_with(|| a.rank.cmp(&b.rank))
    });
    movers.truncate(limit);
    movers
}

pub fn build_report(
    scope: &ScopeKey,
    published_at: Option<DateTime<Utc>>,
    entries: &[RankEntry],
    top: usize,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Leaderboard Report");
    let Some(first) = entries.first() else {
        let _ = writeln!(output, "Nothing published yet for {scope}.");
        return output;
    };

    let updated = published_at
        .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let _ = writeln!(
        output,
        "Generated for {} (period starting {}, {} students, last updated {})",
        scope, first.period, first.total_in_scope, updated
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Top Students");

    for entry in entries.iter().take(top) {
        let _ = writeln!(
            output,
            "- #{} {} score {:.2} (top {:.1}%, {})",
            entry.rank,
            entry.student_id,
            entry.composite_score,
            100.0 - entry.percentile,
            entry.movement
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Biggest Movers");

    let movers = biggest_movers(entries, 5);
    if movers.is_empty() {
        let _ = writeln!(output, "No rank changes since the previous period.");
    } else {
        for entry in movers {
            let _ = writeln!(
                output,
                "- {} now #{} ({} from #{})",
                entry.student_id,
                entry.rank,
                entry.movement,
                entry.previous_rank.unwrap_or(entry.rank)
            );
        }
    }

    let newcomers = entries
        .iter()
        .filter(|entry| entry.movement == Movement::New)
        .count();
    let _ = writeln!(output);
    let _ = writeln!(output, "## New Entrants");
    let _ = writeln!(output, "{newcomers} students ranked for the first time.");

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scope;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn entry(rank: u32, previous_rank: Option<u32>) -> RankEntry {
        RankEntry {
            scope: Scope::College,
            scope_id: "iit-b".into(),
            student_id: Uuid::new_v4(),
            period: NaiveDate::from_ymd_opt(2026, 10, 5).unwrap(),
            rank,
            percentile: (4 - rank) as f64 / 4.0 * 100.0,
            previous_rank,
            movement: match previous_rank {
                Some(previous) => Movement::Delta(previous as i64 - rank as i64),
                None => Movement::New,
            },
            total_in_scope: 4,
            composite_score: 90.0 - rank as f64,
        }
    }

    #[test]
    fn movers_sorted_by_magnitude() {
        let entries = vec![
            entry(1, Some(4)),
            entry(2, Some(2)),
            entry(3, None),
            entry(4, Some(2)),
        ];
        let movers = biggest_movers(&entries, 5);
        let ranks: Vec<u32> = movers.iter().map(|entry| entry.rank).collect();
        assert_eq!(ranks, vec![1, 4]);
    }

    #[test]
    fn report_lists_top_and_movers() {
        let entries = vec![entry(1, Some(3)), entry(2, None), entry(3, Some(1))];
        let scope = ScopeKey::new(Scope::College, "iit-b");
        let report = build_report(&scope, None, &entries, 2);

        assert!(report.contains("Generated for college/iit-b (period starting 2026-10-05"));
        assert!(report.contains("- #1 "));
        assert!(!report.contains("- #3 "));
        assert!(report.contains("(+2 from #3)"));
        assert!(report.contains("(-2 from #1)"));
        assert!(report.contains("1 students ranked for the first time."));
    }

    #[test]
    fn empty_scope_reports_nothing_published() {
        let report = build_report(&ScopeKey::national(), None, &[], 10);
        assert!(report.contains("Nothing published yet for national/national."));
    }
}
