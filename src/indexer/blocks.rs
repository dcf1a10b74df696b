//! Parallel fetch of a confirmed block range. The range is split into
//! contiguous sub-ranges, one per worker; each worker fetches its blocks
//! sequentially under retry and returns them in order, so the merged batch
//! is ordered by construction.

use ethers::types::{Block, Transaction};
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;

use crate::chain::ChainApi;
use crate::error::IndexerError;
use crate::retry::{retry, Backoff};

/// Splits `count` items into at most `workers` contiguous `[start, stop)`
/// offset ranges of near-equal size.
pub(crate) fn partition(count: u64, workers: u64) -> Vec<(u64, u64)> {
    if count == 0 {
        return Vec::new();
    }

    let workers = workers.clamp(1, count);
    let per_worker = (count + workers - 1) / workers;

    let mut parts = Vec::with_capacity(workers as usize);
    let mut start = 0;
    while start < count {
        let stop = (start + per_worker).min(count);
        parts.push((start, stop));
        start = stop;
    }

    parts
}

/// Fetches `[start, end_inclusive]`; index `i` of the result holds block
/// `start + i`. The first worker failure cancels the remaining workers.
pub(crate) async fn fetch_block_range(
    chain: &dyn ChainApi,
    backoff: Backoff,
    shutdown: &CancellationToken,
    start: u64,
    end_inclusive: u64,
    num_parallel_req: u64,
) -> Result<Vec<Block<Transaction>>, IndexerError> {
    let count = end_inclusive + 1 - start;

    let workers = partition(count, num_parallel_req).into_iter().map(
        |(offset_start, offset_stop)| async move {
            let mut blocks = Vec::with_capacity((offset_stop - offset_start) as usize);
            for number in start + offset_start..start + offset_stop {
                let block = retry(backoff, shutdown, "BlockByNumber", move || {
                    chain.block_by_number(Some(number))
                })
                .await?;
                blocks.push(block);
            }
            Ok::<_, IndexerError>(blocks)
        },
    );

    let fetched = try_join_all(workers).await?;
    let blocks: Vec<Block<Transaction>> = fetched.into_iter().flatten().collect();

    if blocks.len() as u64 != count {
        return Err(IndexerError::RpcPermanent(
            "unexpected number of blocks returned".into(),
        ));
    }

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use std::time::Duration;

    fn fast() -> Backoff {
        Backoff {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed_time: Some(Duration::from_millis(100)),
        }
    }

    #[test]
    fn partition_covers_the_range_in_order() {
        assert_eq!(partition(10, 4), vec![(0, 3), (3, 6), (6, 9), (9, 10)]);
        assert_eq!(partition(4, 4), vec![(0, 1), (1, 2), (2, 3), (3, 4)]);
        // More workers than items degrades to one item per worker.
        assert_eq!(partition(2, 8), vec![(0, 1), (1, 2)]);
        assert_eq!(partition(0, 4), vec![]);
        // A zero worker count still makes progress.
        assert_eq!(partition(5, 0), vec![(0, 5)]);
    }

    #[tokio::test]
    async fn fetches_blocks_in_ascending_order() {
        let chain = MockChain::with_blocks(100, 1_700_000_000, 2);

        let blocks = fetch_block_range(&chain, fast(), &CancellationToken::new(), 5, 14, 3).await.unwrap();

        assert_eq!(blocks.len(), 10);
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.number.unwrap().as_u64(), 5 + i as u64);
            assert_eq!(
                block.timestamp.as_u64(),
                chain.timestamp_of(5 + i as u64)
            );
        }
    }

    #[tokio::test]
    async fn single_block_range_works() {
        let chain = MockChain::with_blocks(10, 1_700_000_000, 1);

        let blocks = fetch_block_range(&chain, fast(), &CancellationToken::new(), 7, 7, 4).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].number.unwrap().as_u64(), 7);
    }

    #[tokio::test]
    async fn missing_block_fails_the_whole_batch() {
        let chain = MockChain::with_blocks(10, 1_700_000_000, 1);

        let result = fetch_block_range(&chain, fast(), &CancellationToken::new(), 8, 12, 2).await;
        assert!(matches!(result, Err(IndexerError::RpcPermanent(_))));
    }
}
