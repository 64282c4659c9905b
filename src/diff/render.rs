//! Turns chunks into display rows.
//!
//! Rows carry independent 1-based line numbers for each side. Long unchanged
//! runs are collapsed so only the context around changes is shown:
//!
//! ```text
//!  ┌────┬──────────────┬────┬──────────────┐
//!  │  1 │ header       │  1 │ header       │   unchanged, head kept
//!  │  2 │ 3            │  2 │ 3            │
//!  │    │ 12 lines hidden                   │   hidden marker
//!  │ 15 │ 7            │ 15 │ 7            │   unchanged, tail kept
//!  │ 16 │ 9            │ 16 │ 9            │
//!  │ 17 │ 10         > │ 17 │ 11           │   substitution
//!  │ 18 │ 12         - │    │ Line missing │   deletion
//!  └────┴──────────────┴────┴──────────────┘
//! ```

use super::Chunk;

/// Unchanged runs longer than this are collapsed.
pub const COLLAPSE_THRESHOLD: usize = 5;

/// Lines kept on each side of a collapsed run.
pub const CONTEXT_LINES: usize = 2;

/// Rendering is skipped when the combined output is longer than this.
pub const MAX_RENDERED_CHARS: usize = 5000;

/// One display row of a side-by-side diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Same {
        expected_line: usize,
        actual_line: usize,
        text: String,
    },
    /// Both sides present but different (`>`).
    Substituted {
        expected_line: usize,
        expected: String,
        actual_line: usize,
        actual: String,
    },
    /// Present only in the expected output (`-`).
    Missing { expected_line: usize, expected: String },
    /// Present only in the actual output (`+`).
    Extra { actual_line: usize, actual: String },
    /// A collapsed run of unchanged lines.
    Hidden { count: usize },
}

impl Row {
    pub fn marker(&self) -> &'static str {
        match self {
            Row::Same { .. } | Row::Hidden { .. } => " ",
            Row::Substituted { .. } => ">",
            Row::Missing { .. } => "-",
            Row::Extra { .. } => "+",
        }
    }
}

/// Whether a diff of these line lists is small enough to show. Each side is
/// measured on its own.
pub fn fits(expected: &[String], actual: &[String]) -> bool {
    let chars = |lines: &[String]| -> usize { lines.iter().map(|l| l.chars().count()).sum() };
    chars(expected).max(chars(actual)) <= MAX_RENDERED_CHARS
}

#[derive(Default)]
struct Counters {
    expected: usize,
    actual: usize,
}

impl Counters {
    fn both(&mut self) -> (usize, usize) {
        self.expected += 1;
        self.actual += 1;
        (self.expected, self.actual)
    }
}

/// Lays out chunks as rows.
pub fn rows(chunks: &[Chunk]) -> Vec<Row> {
    let mut rows = Vec::new();
    let mut line = Counters::default();
    let last = chunks.len().saturating_sub(1);

    for (index, chunk) in chunks.iter().enumerate() {
        match chunk {
            Chunk::Changed { expected, actual } => {
                for i in 0..expected.len().max(actual.len()) {
                    match (expected.get(i), actual.get(i)) {
                        (Some(e), Some(a)) => {
                            let (expected_line, actual_line) = line.both();
                            rows.push(Row::Substituted {
                                expected_line,
                                expected: e.clone(),
                                actual_line,
                                actual: a.clone(),
                            });
                        }
                        (Some(e), None) => {
                            line.expected += 1;
                            rows.push(Row::Missing {
                                expected_line: line.expected,
                                expected: e.clone(),
                            });
                        }
                        (None, Some(a)) => {
                            line.actual += 1;
                            rows.push(Row::Extra {
                                actual_line: line.actual,
                                actual: a.clone(),
                            });
                        }
                        (None, None) => {}
                    }
                }
            }
            Chunk::Unchanged(lines) if lines.len() > COLLAPSE_THRESHOLD => {
                // No context is needed before the first change or after the last.
                let head = if index == 0 { 0 } else { CONTEXT_LINES };
                let tail = if index == last { 0 } else { CONTEXT_LINES };
                let hidden = lines.len() - head - tail;

                push_same(&mut rows, &mut line, &lines[..head]);
                rows.push(Row::Hidden { count: hidden });
                line.expected += hidden;
                line.actual += hidden;
                push_same(&mut rows, &mut line, &lines[lines.len() - tail..]);
            }
            Chunk::Unchanged(lines) => push_same(&mut rows, &mut line, lines),
        }
    }

    rows
}

fn push_same(rows: &mut Vec<Row>, line: &mut Counters, lines: &[String]) {
    for text in lines {
        let (expected_line, actual_line) = line.both();
        rows.push(Row::Same {
            expected_line,
            actual_line,
            text: text.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{Strategy, chunks, normalize};

    fn numbered(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
        range.map(|i| i.to_string()).collect()
    }

    #[test]
    fn test_substitution_and_missing_line() {
        let chunks = vec![Chunk::Changed {
            expected: vec!["a".into(), "b".into()],
            actual: vec!["x".into()],
        }];

        assert_eq!(
            rows(&chunks),
            vec![
                Row::Substituted {
                    expected_line: 1,
                    expected: "a".into(),
                    actual_line: 1,
                    actual: "x".into(),
                },
                Row::Missing {
                    expected_line: 2,
                    expected: "b".into(),
                },
            ]
        );
    }

    #[test]
    fn test_line_numbers_diverge_after_insertion() {
        let expected = normalize("1\n2\n3");
        let actual = normalize("1\nnew\n2\n3");
        let rows = rows(&chunks(Strategy::Lcs, &expected, &actual));

        assert_eq!(
            rows[1],
            Row::Extra {
                actual_line: 2,
                actual: "new".into(),
            }
        );
        assert_eq!(
            rows[2],
            Row::Same {
                expected_line: 2,
                actual_line: 3,
                text: "2".into(),
            }
        );
    }

    #[test]
    fn test_middle_run_keeps_context_on_both_ends() {
        let mut expected = vec!["x".to_string()];
        expected.extend(numbered(1..=10));
        expected.push("y".to_string());
        let mut actual = vec!["X".to_string()];
        actual.extend(numbered(1..=10));
        actual.push("Y".to_string());

        let rows = rows(&chunks(Strategy::LineByLine, &expected, &actual));
        let markers: Vec<&str> = rows.iter().map(Row::marker).collect();
        assert_eq!(markers, vec![">", " ", " ", " ", " ", " ", ">"]);
        assert_eq!(rows[3], Row::Hidden { count: 6 });
        assert_eq!(
            rows[4],
            Row::Same {
                expected_line: 10,
                actual_line: 10,
                text: "9".into(),
            }
        );
        assert!(matches!(
            rows[6],
            Row::Substituted {
                expected_line: 12,
                actual_line: 12,
                ..
            }
        ));
    }

    #[test]
    fn test_leading_run_drops_head() {
        let mut expected = numbered(1..=8);
        expected.push("end".to_string());
        let mut actual = numbered(1..=8);
        actual.push("END".to_string());

        let rows = rows(&chunks(Strategy::Lcs, &expected, &actual));
        assert_eq!(rows[0], Row::Hidden { count: 6 });
        assert_eq!(
            rows[1],
            Row::Same {
                expected_line: 7,
                actual_line: 7,
                text: "7".into(),
            }
        );
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn test_trailing_run_drops_tail() {
        let mut expected = vec!["start".to_string()];
        expected.extend(numbered(1..=8));
        let mut actual = vec!["START".to_string()];
        actual.extend(numbered(1..=8));

        let rows = rows(&chunks(Strategy::Lcs, &expected, &actual));
        assert_eq!(rows.len(), 4);
        assert_eq!(rows.last(), Some(&Row::Hidden { count: 6 }));
    }

    #[test]
    fn test_short_runs_are_not_collapsed() {
        let expected = numbered(1..=5);
        let mut actual = numbered(1..=5);
        actual.push("6".to_string());

        let rows = rows(&chunks(Strategy::Lcs, &expected, &actual));
        assert_eq!(rows.len(), 6);
        assert!(rows.iter().all(|r| !matches!(r, Row::Hidden { .. })));
    }

    #[test]
    fn test_fits() {
        let small = vec!["x".repeat(100)];
        assert!(fits(&small, &small));

        let limit = vec!["x".repeat(MAX_RENDERED_CHARS)];
        assert!(fits(&limit, &small));
        assert!(fits(&small, &limit));

        let big = vec!["x".repeat(MAX_RENDERED_CHARS + 1)];
        assert!(!fits(&big, &small));
        assert!(!fits(&small, &big));
    }

    #[test]
    fn test_fits_measures_each_side_alone() {
        let expected = vec!["x".repeat(3000)];
        let actual = vec!["y".repeat(3000)];
        assert!(fits(&expected, &actual));

        let split: Vec<String> = (0..5).map(|_| "z".repeat(1001)).collect();
        assert!(!fits(&split, &actual));
    }
}
