//! Output comparison.
//!
//! Expected and actual outputs are first normalized into lines, then split
//! into an ordered list of [`Chunk`]s. Concatenating the expected side of all
//! chunks gives back the expected lines, and likewise for the actual side.
//!
//! Two strategies produce the chunks:
//!
//! | Strategy          | Pairs lines by                     | Good for             |
//! |-------------------|------------------------------------|----------------------|
//! | [`Strategy::LineByLine`] | position                    | fixed-format answers |
//! | [`Strategy::Lcs`]        | longest common subsequence  | inserted/missing rows |
//!
//! Either way the verdict is the same: outputs match exactly when the
//! normalized line lists are equal. Strategies only change how a mismatch is
//! displayed; see [`render`].

pub mod render;

use serde::{Deserialize, Serialize};

/// How changed regions are aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Compare line N with line N.
    LineByLine,
    /// Align on the longest common subsequence (Myers).
    #[default]
    Lcs,
}

/// A run of lines that is either identical on both sides or changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Unchanged(Vec<String>),
    Changed {
        expected: Vec<String>,
        actual: Vec<String>,
    },
}

impl Chunk {
    pub fn is_changed(&self) -> bool {
        matches!(self, Chunk::Changed { .. })
    }

    pub fn expected_lines(&self) -> &[String] {
        match self {
            Chunk::Unchanged(lines) => lines,
            Chunk::Changed { expected, .. } => expected,
        }
    }

    pub fn actual_lines(&self) -> &[String] {
        match self {
            Chunk::Unchanged(lines) => lines,
            Chunk::Changed { actual, .. } => actual,
        }
    }
}

/// Result of comparing an expected output with an actual one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Judgement {
    Accepted,
    /// Outputs differ; both sides are kept normalized for rendering.
    WrongAnswer {
        expected: Vec<String>,
        actual: Vec<String>,
    },
}

impl Judgement {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Judgement::Accepted)
    }
}

/// Splits text into lines for comparison.
///
/// Trailing whitespace is removed from the whole text and from every line.
/// `\r\n`, `\r` and `\n` all end a line. Empty text has no lines.
pub fn normalize(text: &str) -> Vec<String> {
    let text = text.trim_end();
    if text.is_empty() {
        return Vec::new();
    }

    let mut lines = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find(['\r', '\n']) {
        lines.push(rest[..pos].trim_end().to_string());
        let skip = if rest[pos..].starts_with("\r\n") { 2 } else { 1 };
        rest = &rest[pos + skip..];
    }
    lines.push(rest.trim_end().to_string());
    lines
}

/// Compares two outputs after normalization.
pub fn judge(expected: &str, actual: &str) -> Judgement {
    let expected = normalize(expected);
    let actual = normalize(actual);
    if expected == actual {
        Judgement::Accepted
    } else {
        Judgement::WrongAnswer { expected, actual }
    }
}

/// Builds chunks with the given strategy.
pub fn chunks(strategy: Strategy, expected: &[String], actual: &[String]) -> Vec<Chunk> {
    match strategy {
        Strategy::LineByLine => line_by_line(expected, actual),
        Strategy::Lcs => lcs(expected, actual),
    }
}

/// Accumulates lines, merging neighbours of the same kind into one chunk.
#[derive(Default)]
struct ChunkBuilder {
    chunks: Vec<Chunk>,
}

impl ChunkBuilder {
    fn same(&mut self, line: &str) {
        match self.chunks.last_mut() {
            Some(Chunk::Unchanged(lines)) => lines.push(line.to_string()),
            _ => self.chunks.push(Chunk::Unchanged(vec![line.to_string()])),
        }
    }

    fn changed(&mut self) -> (&mut Vec<String>, &mut Vec<String>) {
        if !matches!(self.chunks.last(), Some(Chunk::Changed { .. })) {
            self.chunks.push(Chunk::Changed {
                expected: Vec::new(),
                actual: Vec::new(),
            });
        }
        match self.chunks.last_mut() {
            Some(Chunk::Changed { expected, actual }) => (expected, actual),
            _ => unreachable!("a changed chunk was just pushed"),
        }
    }

    fn removed(&mut self, line: &str) {
        self.changed().0.push(line.to_string());
    }

    fn added(&mut self, line: &str) {
        self.changed().1.push(line.to_string());
    }

    fn finish(self) -> Vec<Chunk> {
        self.chunks
    }
}

/// Pairs lines by index. Leftover lines of the longer side join the trailing
/// changed chunk.
pub fn line_by_line(expected: &[String], actual: &[String]) -> Vec<Chunk> {
    let mut builder = ChunkBuilder::default();

    for (e, a) in expected.iter().zip(actual) {
        if e == a {
            builder.same(e);
        } else {
            builder.removed(e);
            builder.added(a);
        }
    }

    let common = expected.len().min(actual.len());
    for line in &expected[common..] {
        builder.removed(line);
    }
    for line in &actual[common..] {
        builder.added(line);
    }

    builder.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

/// Aligns lines on a longest common subsequence.
pub fn lcs(expected: &[String], actual: &[String]) -> Vec<Chunk> {
    let prefix = expected
        .iter()
        .zip(actual)
        .take_while(|(e, a)| e == a)
        .count();
    let suffix = expected[prefix..]
        .iter()
        .rev()
        .zip(actual[prefix..].iter().rev())
        .take_while(|(e, a)| e == a)
        .count();

    let middle_expected = &expected[prefix..expected.len() - suffix];
    let middle_actual = &actual[prefix..actual.len() - suffix];

    let mut builder = ChunkBuilder::default();
    for line in &expected[..prefix] {
        builder.same(line);
    }

    let (mut i, mut j) = (0, 0);
    for op in myers(middle_expected, middle_actual) {
        match op {
            Op::Equal => {
                builder.same(&middle_expected[i]);
                i += 1;
                j += 1;
            }
            Op::Delete => {
                builder.removed(&middle_expected[i]);
                i += 1;
            }
            Op::Insert => {
                builder.added(&middle_actual[j]);
                j += 1;
            }
        }
    }

    for line in &expected[expected.len() - suffix..] {
        builder.same(line);
    }
    builder.finish()
}

/// Shortest edit script from `a` to `b`, O((N+M)·D).
fn myers(a: &[String], b: &[String]) -> Vec<Op> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = (n + m) as usize;
    if max == 0 {
        return Vec::new();
    }

    // v[k + offset] holds the furthest x reached on diagonal k.
    let offset = max as isize + 1;
    let mut v = vec![0isize; 2 * max + 3];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    'search: for d in 0..=max as isize {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                break 'search;
            }
            k += 2;
        }
    }

    let mut ops = Vec::with_capacity(max);
    let (mut x, mut y) = (n, m);
    for (d, v) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let k = x - y;
        let idx = (k + offset) as usize;

        if d == 0 {
            while x > 0 && y > 0 {
                ops.push(Op::Equal);
                x -= 1;
                y -= 1;
            }
            break;
        }

        let prev_k = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[(prev_k + offset) as usize];
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            ops.push(Op::Equal);
            x -= 1;
            y -= 1;
        }

        ops.push(if x == prev_x { Op::Insert } else { Op::Delete });
        x = prev_x;
        y = prev_y;
    }

    ops.reverse();
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn flatten(chunks: &[Chunk]) -> (Vec<String>, Vec<String>) {
        let expected = chunks.iter().flat_map(|c| c.expected_lines().to_vec()).collect();
        let actual = chunks.iter().flat_map(|c| c.actual_lines().to_vec()).collect();
        (expected, actual)
    }

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize("a\r\nb\rc\nd"), lines(&["a", "b", "c", "d"]));
        assert_eq!(normalize("a  \nb\t\n\n\n"), lines(&["a", "b"]));
        assert_eq!(normalize("a\n\nb"), lines(&["a", "", "b"]));
        assert!(normalize("").is_empty());
        assert!(normalize(" \n\r\n ").is_empty());
    }

    #[test]
    fn test_judge_ignores_trailing_whitespace() {
        assert!(judge("1 2 3\n", "1 2 3").is_accepted());
        assert!(judge("1\r\n2\r\n", "1\n2   \n\n").is_accepted());
        assert!(judge("", "\n\n").is_accepted());
        assert!(!judge("1 2", "1  2").is_accepted());
        assert!(!judge("", "0").is_accepted());
    }

    #[test]
    fn test_line_by_line_substitution() {
        let chunks = line_by_line(&lines(&["1", "2", "3"]), &lines(&["1", "9", "3"]));
        assert_eq!(
            chunks,
            vec![
                Chunk::Unchanged(lines(&["1"])),
                Chunk::Changed {
                    expected: lines(&["2"]),
                    actual: lines(&["9"]),
                },
                Chunk::Unchanged(lines(&["3"])),
            ]
        );
    }

    #[test]
    fn test_line_by_line_leftovers_join_trailing_change() {
        let chunks = line_by_line(&lines(&["a", "b"]), &lines(&["a", "x", "y", "z"]));
        assert_eq!(
            chunks,
            vec![
                Chunk::Unchanged(lines(&["a"])),
                Chunk::Changed {
                    expected: lines(&["b"]),
                    actual: lines(&["x", "y", "z"]),
                },
            ]
        );

        let chunks = line_by_line(&lines(&["a", "b", "c"]), &lines(&["a"]));
        assert_eq!(
            chunks,
            vec![
                Chunk::Unchanged(lines(&["a"])),
                Chunk::Changed {
                    expected: lines(&["b", "c"]),
                    actual: Vec::new(),
                },
            ]
        );
    }

    #[test]
    fn test_line_by_line_does_not_realign() {
        let chunks = line_by_line(&lines(&["a", "b", "c"]), &lines(&["a", "c"]));
        assert_eq!(
            chunks,
            vec![
                Chunk::Unchanged(lines(&["a"])),
                Chunk::Changed {
                    expected: lines(&["b", "c"]),
                    actual: lines(&["c"]),
                },
            ]
        );
    }

    #[test]
    fn test_lcs_detects_deletion() {
        let chunks = lcs(&lines(&["a", "b", "c"]), &lines(&["a", "c"]));
        assert_eq!(
            chunks,
            vec![
                Chunk::Unchanged(lines(&["a"])),
                Chunk::Changed {
                    expected: lines(&["b"]),
                    actual: Vec::new(),
                },
                Chunk::Unchanged(lines(&["c"])),
            ]
        );
    }

    #[test]
    fn test_lcs_detects_insertion_in_middle() {
        let expected = lines(&["1", "2", "3", "4", "5"]);
        let actual = lines(&["1", "2", "x", "3", "4", "y", "5"]);
        let chunks = lcs(&expected, &actual);

        assert_eq!(
            chunks,
            vec![
                Chunk::Unchanged(lines(&["1", "2"])),
                Chunk::Changed {
                    expected: Vec::new(),
                    actual: lines(&["x"]),
                },
                Chunk::Unchanged(lines(&["3", "4"])),
                Chunk::Changed {
                    expected: Vec::new(),
                    actual: lines(&["y"]),
                },
                Chunk::Unchanged(lines(&["5"])),
            ]
        );
    }

    #[test]
    fn test_lcs_keeps_longest_common_run() {
        let expected = lines(&["a", "b", "c", "a", "b", "b", "a"]);
        let actual = lines(&["c", "b", "a", "b", "a", "c"]);
        let chunks = lcs(&expected, &actual);

        let common: usize = chunks
            .iter()
            .filter(|c| !c.is_changed())
            .map(|c| c.expected_lines().len())
            .sum();
        assert_eq!(common, 4);
        assert_eq!(flatten(&chunks), (expected, actual));
    }

    #[test]
    fn test_empty_sides() {
        assert!(lcs(&[], &[]).is_empty());
        assert!(line_by_line(&[], &[]).is_empty());

        let chunks = lcs(&[], &lines(&["x"]));
        assert_eq!(
            chunks,
            vec![Chunk::Changed {
                expected: Vec::new(),
                actual: lines(&["x"]),
            }]
        );
    }

    #[test]
    fn test_chunks_concatenate_back_to_inputs() {
        let cases = [
            (vec!["1", "2", "3"], vec!["1", "9", "3"]),
            (vec!["a", "b", "c", "d"], vec!["d", "c", "b", "a"]),
            (vec![], vec!["only"]),
            (vec!["x", "x", "x"], vec!["x"]),
            (vec!["same", "lines"], vec!["same", "lines"]),
        ];

        for (expected, actual) in cases {
            let expected = lines(&expected);
            let actual = lines(&actual);
            for strategy in [Strategy::LineByLine, Strategy::Lcs] {
                let chunks = chunks(strategy, &expected, &actual);
                assert_eq!(flatten(&chunks), (expected.clone(), actual.clone()));

                let all_unchanged = chunks.iter().all(|c| !c.is_changed());
                assert_eq!(all_unchanged, expected == actual, "{strategy:?}");

                // Neighbouring chunks never share a kind.
                for pair in chunks.windows(2) {
                    assert_ne!(pair[0].is_changed(), pair[1].is_changed());
                }
            }
        }
    }

    #[test]
    fn test_strategy_from_config_value() {
        #[derive(Deserialize)]
        struct Wrapper {
            strategy: Strategy,
        }
        let w: Wrapper = toml::from_str(r#"strategy = "line-by-line""#).unwrap();
        assert_eq!(w.strategy, Strategy::LineByLine);
        assert_eq!(Strategy::default(), Strategy::Lcs);
    }
}
