use std::{any::Any, future::Future, panic::AssertUnwindSafe};

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::BlockError;

/// A group of concurrent tasks sharing one cancellation token.
///
/// The first task to fail cancels the token so siblings can stop early.
/// Cancellation is cooperative: tasks observe it through [`TaskGroup::token`]
/// and reads already in flight run to completion.
pub struct TaskGroup<T> {
    tasks: JoinSet<Result<T, BlockError>>,
    cancel: CancellationToken,
}

impl<T> TaskGroup<T>
where
    T: Send + 'static,
{
    /// Create a group whose token is a child of `parent`.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: parent.child_token(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a task; a panic inside it is reported as [`BlockError::Panic`].
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = Result<T, BlockError>> + Send + 'static,
    {
        self.tasks.spawn(recover_panic(future));
    }

    /// Wait for every task and return the successful outputs along with the
    /// first error observed, if any.
    pub async fn join(mut self) -> (Vec<T>, Option<BlockError>) {
        let mut outputs = Vec::with_capacity(self.tasks.len());
        let mut first_err = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined.map_err(BlockError::from).and_then(|result| result) {
                Ok(output) => outputs.push(output),
                Err(err) => {
                    self.cancel.cancel();
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        (outputs, first_err)
    }

    /// Wait for every task, failing with the first error.
    pub async fn wait(self) -> Result<Vec<T>, BlockError> {
        match self.join().await {
            (outputs, None) => Ok(outputs),
            (_, Some(err)) => Err(err),
        }
    }
}

/// Turn a panic raised while polling `future` into an error.
pub async fn recover_panic<F, T>(future: F) -> Result<T, BlockError>
where
    F: Future<Output = Result<T, BlockError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(BlockError::Panic(panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{recover_panic, TaskGroup};
    use crate::error::BlockError;

    #[tokio::test]
    async fn collects_outputs() {
        let mut group = TaskGroup::new(&CancellationToken::new());
        for i in 0..4u32 {
            group.spawn(async move { Ok(i) });
        }
        let mut outputs = group.wait().await.unwrap();
        outputs.sort();
        assert_eq!(outputs, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn first_error_cancels_siblings() {
        let parent = CancellationToken::new();
        let mut group = TaskGroup::new(&parent);
        let token = group.token();
        group.spawn(async move {
            token.cancelled().await;
            Err(BlockError::Cancelled)
        });
        group.spawn(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(BlockError::NoBlocksToMerge)
        });
        group.spawn(async { Ok(()) });

        let (outputs, err) = group.join().await;
        assert_eq!(outputs.len(), 1);
        assert!(matches!(err, Some(BlockError::NoBlocksToMerge)));
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let result: Result<(), BlockError> = recover_panic(async {
            if true {
                panic!("boom");
            }
            Ok(())
        })
        .await;
        match result {
            Err(BlockError::Panic(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected result: {other:?}"),
        }

        let mut group = TaskGroup::<()>::new(&CancellationToken::new());
        group.spawn(async {
            if true {
                panic!("worker {}", 7);
            }
            Ok(())
        });
        let err = group.wait().await.unwrap_err();
        assert!(matches!(err, BlockError::Panic(ref msg) if msg == "worker 7"));
    }
}
