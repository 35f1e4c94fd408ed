use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::{ready, Stream};
use pin_project_lite::pin_project;

use super::ProfileEntry;
use crate::error::BlockError;

pin_project! {
    /// Drops rows whose fingerprint and timestamp equal those of the row
    /// emitted just before.
    pub struct DedupStream<S> {
        #[pin]
        inner: S,
        previous: Option<(u64, i64)>,
    }
}

impl<S> DedupStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            previous: None,
        }
    }
}

impl<S> Stream for DedupStream<S>
where
    S: Stream<Item = Result<ProfileEntry, BlockError>>,
{
    type Item = Result<ProfileEntry, BlockError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(entry)) => {
                    let key = (entry.fingerprint, entry.timestamp());
                    if *this.previous == Some(key) {
                        continue;
                    }
                    *this.previous = Some(key);
                    return Poll::Ready(Some(Ok(entry)));
                }
                other => return Poll::Ready(other),
            }
        }
    }
}
