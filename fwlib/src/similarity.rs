use std::collections::HashMap;

/// Compute the Ratcliff/Obershelp similarity of two strings as `2 * M / T`,
/// where `M` is the number of characters in matching blocks and `T` is the
/// total number of characters in both strings. The result is in `[0.0, 1.0]`.
/// Two empty strings are considered identical.
pub fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

/// Sum of the lengths of all matching blocks. The longest common block is
/// found first, then the same procedure is applied recursively to the pieces
/// on either side of it.
fn matching_chars(a: &[char], b: &[char]) -> usize {
    let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
    for (j, c) in b.iter().enumerate() {
        b2j.entry(*c).or_default().push(j);
    }

    let mut queue = vec![(0, a.len(), 0, b.len())];
    let mut matched = 0;

    while let Some((alo, ahi, blo, bhi)) = queue.pop() {
        let (i, j, k) = longest_match(a, &b2j, alo..ahi, blo..bhi);
        if k == 0 {
            continue;
        }

        matched += k;

        if alo < i && blo < j {
            queue.push((alo, i, blo, j));
        }
        if i + k < ahi && j + k < bhi {
            queue.push((i + k, ahi, j + k, bhi));
        }
    }

    matched
}

/// Find the longest block `a[i..i + k] == b[j..j + k]` within the given
/// ranges. Ties resolve to the block starting earliest in `a`, then earliest
/// in `b`. Returns `(i, j, k)`.
fn longest_match(
    a: &[char],
    b2j: &HashMap<char, Vec<usize>>,
    a_range: std::ops::Range<usize>,
    b_range: std::ops::Range<usize>,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_size) = (a_range.start, b_range.start, 0);
    // Length of the match ending at b[j] for the previous value of i
    let mut j2len: HashMap<usize, usize> = HashMap::new();

    for i in a_range {
        let mut new_j2len = HashMap::new();

        if let Some(indexes) = b2j.get(&a[i]) {
            for &j in indexes {
                if j < b_range.start {
                    continue;
                } else if j >= b_range.end {
                    break;
                }

                let k = j.checked_sub(1)
                    .and_then(|prev| j2len.get(&prev))
                    .copied()
                    .unwrap_or(0) + 1;
                new_j2len.insert(j, k);

                if k > best_size {
                    best_i = i + 1 - k;
                    best_j = j + 1 - k;
                    best_size = k;
                }
            }
        }

        j2len = new_j2len;
    }

    (best_i, best_j, best_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_identical_and_empty() {
        assert!(approx_eq(ratio("", ""), 1.0));
        assert!(approx_eq(ratio("abc", "abc"), 1.0));
        assert!(approx_eq(ratio("abc", ""), 0.0));
        assert!(approx_eq(ratio("abc", "xyz"), 0.0));
    }

    #[test]
    fn test_ratio() {
        assert!(approx_eq(ratio("abcd", "bcde"), 0.75));
        assert!(approx_eq(ratio("appel", "apple"), 0.8));
        assert!(approx_eq(ratio("appel", "ape"), 0.75));
        assert!(approx_eq(ratio("appel", "peach"), 0.4));
        assert!(approx_eq(ratio("appel", "puppy"), 0.4));
    }

    #[test]
    fn test_symmetric_for_simple_inputs() {
        assert!(approx_eq(ratio("ultimate", "ultimate c"), ratio("ultimate c", "ultimate")));
    }

    #[test]
    fn test_asymmetric() {
        assert!(approx_eq(ratio("tide", "diet"), 0.25));
        assert!(approx_eq(ratio("diet", "tide"), 0.5));
        assert!(approx_eq(ratio("aacb", "abab"), 0.75));
        assert!(approx_eq(ratio("abab", "aacb"), 0.5));
    }

    #[test]
    fn test_non_ascii() {
        assert!(approx_eq(ratio("é", "é"), 1.0));
        assert!(approx_eq(ratio("aé", "ae"), 0.5));
    }

    #[test]
    fn test_matching_blocks_on_both_sides() {
        let a: Vec<char> = "qabxcd".chars().collect();
        let b: Vec<char> = "abycdf".chars().collect();
        // Blocks: "ab" and "cd"
        assert_eq!(matching_chars(&a, &b), 4);
    }
}
