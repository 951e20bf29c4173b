//! Contiguous sharding of the question list across independent processes.

use crate::error::{EvalError, EvalResult};

/// Which slice of the ordered question list this process handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAssignment {
    pub num_chunks: usize,
    pub chunk_idx: usize,
}

impl ChunkAssignment {
    pub fn new(num_chunks: usize, chunk_idx: usize) -> EvalResult<Self> {
        if num_chunks == 0 {
            return Err(EvalError::InvalidArgument(
                "num_chunks must be at least 1".to_string(),
            ));
        }
        if chunk_idx >= num_chunks {
            return Err(EvalError::InvalidArgument(format!(
                "chunk_idx {} is out of range for {} chunks",
                chunk_idx, num_chunks
            )));
        }
        Ok(Self {
            num_chunks,
            chunk_idx,
        })
    }

    pub fn select<'a, T>(&self, list: &'a [T]) -> &'a [T] {
        chunk_bounds(list.len(), self.num_chunks, self.chunk_idx)
            .map(|(start, end)| &list[start..end])
            .unwrap_or(&[])
    }
}

/// `[start, end)` of chunk `k`; every chunk holds `ceil(len / n)` items except
/// trailing ones, which may be shorter or empty.
fn chunk_bounds(len: usize, n: usize, k: usize) -> Option<(usize, usize)> {
    if n == 0 || k >= n {
        return None;
    }
    let chunk_size = len.div_ceil(n);
    let start = usize::min(k * chunk_size, len);
    let end = usize::min(start + chunk_size, len);
    Some((start, end))
}

/// Splits `list` into exactly `n` contiguous chunks.
pub fn split_list<T>(list: &[T], n: usize) -> EvalResult<Vec<&[T]>> {
    if n == 0 {
        return Err(EvalError::InvalidArgument(
            "cannot split into 0 chunks".to_string(),
        ));
    }
    Ok((0..n)
        .filter_map(|k| chunk_bounds(list.len(), n, k))
        .map(|(start, end)| &list[start..end])
        .collect())
}

/// The `k`-th (0-indexed) of the `n` chunks produced by [`split_list`].
pub fn get_chunk<T>(list: &[T], n: usize, k: usize) -> EvalResult<&[T]> {
    let assignment = ChunkAssignment::new(n, k)?;
    Ok(assignment.select(list))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_concatenated_chunks_reconstruct_list() {
        for len in 0..40 {
            let list = (0..len).collect::<Vec<usize>>();
            for n in 1..12 {
                let chunk_size = len.div_ceil(n);
                let mut joined = vec![];
                let mut shrunk = false;
                for k in 0..n {
                    let chunk = get_chunk(&list, n, k).unwrap();
                    // full chunks first, then at most one partial, then empties
                    if shrunk {
                        assert!(chunk.is_empty(), "len={len} n={n} k={k}");
                    }
                    if chunk.len() < chunk_size {
                        shrunk = true;
                    }
                    assert!(chunk.len() <= chunk_size);
                    joined.extend_from_slice(chunk);
                }
                assert_eq!(joined, list, "len={len} n={n}");
            }
        }
    }

    #[test_log::test]
    fn test_single_chunk_is_whole_list() {
        let list = vec!["a", "b", "c"];
        assert_eq!(get_chunk(&list, 1, 0).unwrap(), list.as_slice());
    }

    #[test_log::test]
    fn test_ceiling_division_sizes() {
        let list = (0..10).collect::<Vec<_>>();
        let sizes = split_list(&list, 4)
            .unwrap()
            .iter()
            .map(|c| c.len())
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![3, 3, 3, 1]);

        // 5 items over 4 chunks leaves the last one empty
        let list = (0..5).collect::<Vec<_>>();
        let chunks = split_list(&list, 4).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3], &[] as &[i32]);
        assert_eq!(get_chunk(&list, 4, 2).unwrap(), &[4]);
    }

    #[test_log::test]
    fn test_invalid_assignment() {
        let list = vec![1, 2, 3];
        assert!(matches!(
            get_chunk(&list, 0, 0),
            Err(EvalError::InvalidArgument(_))
        ));
        assert!(matches!(
            get_chunk(&list, 2, 2),
            Err(EvalError::InvalidArgument(_))
        ));
        assert!(split_list(&list, 0).is_err());
    }

    #[test_log::test]
    fn test_empty_list() {
        let list: Vec<u8> = vec![];
        assert!(get_chunk(&list, 3, 1).unwrap().is_empty());
    }
}
