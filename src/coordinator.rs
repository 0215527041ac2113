//! The background task which owns a listener's connection limit.
//!
//! The coordinator is the only writer of the limit. It moves the number of tokens in existence
//! towards the latest requested target one token at a time, adding tokens to the jar or waiting
//! for resting ones to remove. Once shut down it reclaims every token, which means waiting for
//! every active connection to close, then closes the jar and signals that draining is complete.

use std::{
    cmp,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::jar::Jar;

const ADDS_PER_YIELD: usize = 64;

/// The listener's side of the coordinator.
#[derive(Debug)]
pub(crate) struct Handle {
    target: watch::Sender<usize>,
    shutdown: CancellationToken,
    drained: CancellationToken,
    limit: Arc<AtomicUsize>,
}

struct Coordinator {
    jar: Jar,
    targets: watch::Receiver<usize>,
    shutdown: CancellationToken,
    drained: CancellationToken,

    /// Published copy of `limit`, for observers.
    published: Arc<AtomicUsize>,

    /// Tokens in existence: resting in the jar or held by connections.
    limit: usize,
    target: usize,
}

enum Step {
    Add,
    Removed,
    Retarget(usize),
    Stop,
}

/// Start a coordinator managing the tokens in `jar`.
///
/// Must be called from within a tokio runtime.
pub(crate) fn spawn(jar: Jar) -> Handle {
    let (target_tx, targets) = watch::channel(0);
    let shutdown = CancellationToken::new();
    let drained = CancellationToken::new();
    let limit = Arc::new(AtomicUsize::new(0));

    let coordinator = Coordinator {
        jar,
        targets,
        shutdown: shutdown.clone(),
        drained: drained.clone(),
        published: Arc::clone(&limit),
        limit: 0,
        target: 0,
    };
    tokio::spawn(coordinator.run());

    Handle {
        target: target_tx,
        shutdown,
        drained,
        limit,
    }
}

impl Handle {
    /// Request a new limit. Only the latest request is guaranteed to be seen.
    pub(crate) fn set_target(&self, target: usize) {
        self.target.send_replace(target);
    }

    pub(crate) fn target(&self) -> usize {
        *self.target.borrow()
    }

    /// The number of tokens in existence, as last published by the coordinator.
    pub(crate) fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Stop adjusting the limit and start draining.
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until every token has been reclaimed after shutdown.
    pub(crate) async fn drained(&self) {
        self.drained.cancelled().await;
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.drained.is_cancelled()
    }
}

impl Coordinator {
    async fn run(mut self) {
        debug!("connection limit coordinator started");

        loop {
            let step = match self.limit.cmp(&self.target) {
                cmp::Ordering::Less => self.increase().await,
                cmp::Ordering::Equal => self.idle().await,
                cmp::Ordering::Greater => self.decrease().await,
            };

            match step {
                Step::Add => {
                    // Publish first, so observers never see more tokens than the limit.
                    self.limit += 1;
                    self.publish();
                    self.jar.add();
                    trace!(limit = self.limit, target = self.target, "added token");

                    // Growing never waits, so let other tasks in now and then.
                    if self.limit % ADDS_PER_YIELD == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                Step::Removed => {
                    self.limit -= 1;
                    self.publish();
                    trace!(limit = self.limit, target = self.target, "removed token");
                }
                Step::Retarget(target) => {
                    debug!(limit = self.limit, target, "new connection limit requested");
                    self.target = target;
                }
                Step::Stop => break,
            }
        }

        self.drain().await;
    }

    async fn increase(&mut self) -> Step {
        tokio::select! {
            biased;
            step = signal(&mut self.targets, &self.shutdown) => step,
            // Adding never has to wait, but pending signals go first.
            () = std::future::ready(()) => Step::Add,
        }
    }

    async fn decrease(&mut self) -> Step {
        let jar = &self.jar;
        tokio::select! {
            biased;
            step = signal(&mut self.targets, &self.shutdown) => step,
            removed = jar.remove() => if removed { Step::Removed } else { Step::Stop },
        }
    }

    async fn idle(&mut self) -> Step {
        signal(&mut self.targets, &self.shutdown).await
    }

    /// Reclaim every token in existence, then close the jar.
    async fn drain(mut self) {
        debug!(
            limit = self.limit,
            held = self.jar.held(),
            "draining connections"
        );

        while self.limit > 0 {
            if !self.jar.remove().await {
                break;
            }
            self.limit -= 1;
            self.publish();
        }
        self.limit = 0;
        self.publish();

        self.jar.close();
        self.drained.cancel();

        debug!("connections drained");
    }

    fn publish(&self) {
        self.published.store(self.limit, Ordering::Release);
    }
}

/// Wait for a new target or a shutdown request.
///
/// A dropped listener counts as a shutdown request.
async fn signal(targets: &mut watch::Receiver<usize>, shutdown: &CancellationToken) -> Step {
    tokio::select! {
        biased;
        () = shutdown.cancelled() => Step::Stop,
        changed = targets.changed() => match changed {
            Ok(()) => Step::Retarget(*targets.borrow_and_update()),
            Err(_) => Step::Stop,
        },
    }
}
