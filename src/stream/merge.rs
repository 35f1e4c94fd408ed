use std::{
    cmp::Ordering,
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::{ready, Stream};

use super::{ProfileEntry, ProfileStream};
use crate::error::BlockError;

enum MergeState {
    /// Pulling the first entry of stream `n`.
    Init(usize),
    /// Pulling the entry that replaces the last winner of stream `n`.
    Refill(usize),
    Ready,
    Done,
}

/// K-way merge of ordered streams over a tree of losers.
///
/// Internal node `i` (for `1 <= i < k`) holds the stream that lost the match
/// played at that node; `tree[0]` holds the overall winner. Leaf `i` sits at
/// position `k + i`. An exhausted stream has no head and loses every match.
pub struct MergeStream {
    streams: Vec<ProfileStream>,
    heads: Vec<Option<ProfileEntry>>,
    tree: Vec<usize>,
    state: MergeState,
}

impl MergeStream {
    pub fn new(streams: Vec<ProfileStream>) -> Self {
        let k = streams.len();
        Self {
            heads: (0..k).map(|_| None).collect(),
            tree: vec![0; k],
            state: if k == 0 {
                MergeState::Done
            } else {
                MergeState::Init(0)
            },
            streams,
        }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        match (&self.heads[a], &self.heads[b]) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(x), Some(y)) => x.compare(y).then(a.cmp(&b)) == Ordering::Less,
        }
    }

    /// Play every match below node `pos`, returning the winner.
    fn play(&mut self, pos: usize) -> usize {
        let k = self.streams.len();
        if pos >= k {
            return pos - k;
        }
        let left = self.play(2 * pos);
        let right = self.play(2 * pos + 1);
        let (winner, loser) = if self.less(right, left) {
            (right, left)
        } else {
            (left, right)
        };
        self.tree[pos] = loser;
        winner
    }

    /// Replay the matches on the path from `leaf` to the root.
    fn replay(&mut self, leaf: usize) {
        let mut winner = leaf;
        let mut node = (leaf + self.streams.len()) / 2;
        while node > 0 {
            let loser = self.tree[node];
            if self.less(loser, winner) {
                self.tree[node] = winner;
                winner = loser;
            }
            node /= 2;
        }
        self.tree[0] = winner;
    }

    fn poll_head(
        &mut self,
        n: usize,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), BlockError>> {
        match ready!(self.streams[n].as_mut().poll_next(cx)) {
            Some(Ok(entry)) => self.heads[n] = Some(entry),
            Some(Err(err)) => return Poll::Ready(Err(err)),
            None => self.heads[n] = None,
        }
        Poll::Ready(Ok(()))
    }
}

impl Stream for MergeStream {
    type Item = Result<ProfileEntry, BlockError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.state {
                MergeState::Init(n) if n < this.streams.len() => {
                    if let Err(err) = ready!(this.poll_head(n, cx)) {
                        this.state = MergeState::Done;
                        return Poll::Ready(Some(Err(err)));
                    }
                    this.state = MergeState::Init(n + 1);
                }
                MergeState::Init(_) => {
                    this.tree[0] = this.play(1);
                    this.state = MergeState::Ready;
                }
                MergeState::Refill(n) => {
                    if let Err(err) = ready!(this.poll_head(n, cx)) {
                        this.state = MergeState::Done;
                        return Poll::Ready(Some(Err(err)));
                    }
                    this.replay(n);
                    this.state = MergeState::Ready;
                }
                MergeState::Ready => {
                    let winner = this.tree[0];
                    match this.heads[winner].take() {
                        Some(entry) => {
                            this.state = MergeState::Refill(winner);
                            return Poll::Ready(Some(Ok(entry)));
                        }
                        None => {
                            this.state = MergeState::Done;
                            return Poll::Ready(None);
                        }
                    }
                }
                MergeState::Done => return Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{stream, StreamExt};

    use super::MergeStream;
    use crate::{
        error::BlockError,
        stream::{
            tests::{entry, source},
            ProfileStream,
        },
    };

    fn timestamps(out: &[crate::stream::ProfileEntry]) -> Vec<(usize, i64)> {
        out.iter().map(|e| (e.source, e.timestamp())).collect()
    }

    #[tokio::test]
    async fn merges_in_order() {
        for k in 1..=7usize {
            let streams = (0..k)
                .map(|s| {
                    source(
                        (0..5)
                            .map(|i| entry(s, "svc", (i * k + s) as i64))
                            .collect(),
                    )
                })
                .collect();
            let out: Vec<_> = MergeStream::new(streams).map(Result::unwrap).collect().await;
            assert_eq!(out.len(), 5 * k);
            for pair in out.windows(2) {
                assert!(pair[0].timestamp() < pair[1].timestamp());
            }
        }
    }

    #[tokio::test]
    async fn orders_by_labels_then_time() {
        let merged = MergeStream::new(vec![
            source(vec![entry(0, "b", 1), entry(0, "c", 0)]),
            source(vec![entry(1, "a", 9), entry(1, "b", 0), entry(1, "b", 1)]),
        ]);
        let out: Vec<_> = merged.map(Result::unwrap).collect().await;
        assert_eq!(timestamps(&out), vec![(1, 9), (1, 0), (0, 1), (1, 1), (0, 0)]);
    }

    #[tokio::test]
    async fn empty_inputs() {
        let out: Vec<_> = MergeStream::new(vec![]).collect().await;
        assert!(out.is_empty());
        let out: Vec<_> = MergeStream::new(vec![source(vec![]), source(vec![])])
            .collect()
            .await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn stops_on_error() {
        let failing: ProfileStream = Box::pin(stream::iter(vec![
            Ok(entry(1, "a", 2)),
            Err(BlockError::corrupted("bad row")),
        ]));
        let out: Vec<_> = MergeStream::new(vec![source(vec![entry(0, "a", 1)]), failing])
            .collect()
            .await;
        assert_eq!(out.len(), 3);
        assert!(out[0].is_ok() && out[1].is_ok());
        assert!(out[2].is_err());
    }
}
