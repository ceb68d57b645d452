//! Line matching for the three-way merge.

/// Edit cost above which the middle of two inputs is treated as entirely
/// replaced instead of being searched for a minimal edit script.
const MAX_COST: usize = 2048;

/// Returns the pairs `(i, j)` with `a[i] == b[j]` of a longest common
/// subsequence of `a` and `b`, in increasing order.
///
/// Common prefix and suffix are matched directly; only the middle goes
/// through Myers' O(ND) search.
pub(crate) fn matches<T: PartialEq>(a: &[T], b: &[T]) -> Vec<(usize, usize)> {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();

    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let mut out: Vec<_> = (0..prefix).map(|i| (i, i)).collect();

    let middle_a = &a[prefix..a.len() - suffix];
    let middle_b = &b[prefix..b.len() - suffix];

    if !middle_a.is_empty() && !middle_b.is_empty() {
        if let Some(pairs) = myers(middle_a, middle_b) {
            out.extend(pairs.into_iter().map(|(i, j)| (i + prefix, j + prefix)));
        }
    }

    let tail_a = a.len() - suffix;
    let tail_b = b.len() - suffix;
    out.extend((0..suffix).map(|i| (tail_a + i, tail_b + i)));

    out
}

/// Myers' greedy diff. Returns `None` when the edit cost exceeds
/// [`MAX_COST`].
fn myers<T: PartialEq>(a: &[T], b: &[T]) -> Option<Vec<(usize, usize)>> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let limit = (n + m).min(MAX_COST as isize);

    let offset = limit + 1;
    let mut v = vec![0isize; 2 * offset as usize + 1];

    // trace[d] holds the furthest x for diagonals -d..=d after round d.
    let mut trace: Vec<Vec<isize>> = Vec::new();

    for d in 0..=limit {
        let mut done = false;

        for k in (-d..=d).step_by(2) {
            let i = (k + offset) as usize;

            let mut x = if k == -d || (k != d && v[i - 1] < v[i + 1]) {
                v[i + 1]
            } else {
                v[i - 1] + 1
            };
            let mut y = x - k;

            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }

            v[i] = x;

            if x >= n && y >= m {
                done = true;
                break;
            }
        }

        let lo = (offset - d) as usize;
        let hi = (offset + d) as usize;
        trace.push(v[lo..=hi].to_vec());

        if done {
            return Some(backtrack(&trace, n, m));
        }
    }

    None
}

fn backtrack(trace: &[Vec<isize>], n: isize, m: isize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    let (mut x, mut y) = (n, m);

    for d in (0..trace.len() as isize).rev() {
        if d == 0 {
            while x > 0 && y > 0 {
                x -= 1;
                y -= 1;
                pairs.push((x as usize, y as usize));
            }
            break;
        }

        let prev = &trace[(d - 1) as usize];
        let furthest = |k: isize| prev[(k + d - 1) as usize];

        let k = x - y;
        let prev_k = if k == -d || (k != d && furthest(k - 1) < furthest(k + 1)) {
            k + 1
        } else {
            k - 1
        };

        let prev_x = furthest(prev_k);
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            x -= 1;
            y -= 1;
            pairs.push((x as usize, y as usize));
        }

        x = prev_x;
        y = prev_y;
    }

    pairs.reverse();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcs_len(a: &str, b: &str) -> usize {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        let pairs = matches(&a, &b);

        for window in pairs.windows(2) {
            assert!(window[0].0 < window[1].0 && window[0].1 < window[1].1);
        }
        for &(i, j) in &pairs {
            assert_eq!(a[i], b[j]);
        }

        pairs.len()
    }

    #[test]
    fn test_classic_example() {
        assert_eq!(lcs_len("ABCABBA", "CBABAC"), 4);
    }

    #[test]
    fn test_prefix_suffix_and_empty() {
        assert_eq!(lcs_len("abcxyz", "abcQxyz"), 6);
        assert_eq!(lcs_len("", "abc"), 0);
        assert_eq!(lcs_len("abc", ""), 0);
        assert_eq!(lcs_len("same", "same"), 4);
    }

    #[test]
    fn test_disjoint() {
        assert_eq!(lcs_len("abc", "xyz"), 0);
    }

    #[test]
    fn test_insert_in_middle() {
        let a = ["fn a() {}", "fn b() {}", "fn c() {}"];
        let b = ["fn a() {}", "fn x() {}", "fn b() {}", "fn y() {}", "fn c() {}"];

        assert_eq!(matches(&a, &b), vec![(0, 0), (1, 2), (2, 4)]);
    }
}
