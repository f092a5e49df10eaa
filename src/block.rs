//! Per-direction operation lock
//!
//! A session has one [`Block`] for reading and one for writing. Each block
//! owns the resources its direction needs (transport half, buffers, codec
//! state) and lends them to exactly one operation at a time.
//!
//! Waiting operations are kept in a FIFO queue. On release the resources are
//! handed straight to the first waiter, so a new `try_lock` can never
//! overtake an operation that is already queued. A guard may also release
//! early to only a subset of waiters (`yield_to`), which is how control frame
//! replies cut in between the fragments of a long outgoing message. The
//! yielding operation resumes ahead of every waiter it did not let in.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// What an operation holding a block is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    /// A message read
    Read,
    /// A data frame write
    Write,
    /// A user ping or pong
    Ping,
    /// A pong or close sent by the read engine in answer to the peer
    Reply,
    /// The close handshake
    Close,
}

impl OpKind {
    /// Operations that may run between the frames of a fragmented message
    #[inline]
    pub fn is_control(self) -> bool {
        matches!(self, OpKind::Ping | OpKind::Reply | OpKind::Close)
    }
}

/// Identity of one operation on a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token {
    id: u64,
    kind: OpKind,
}

struct Waiter<T> {
    token: Token,
    tx: oneshot::Sender<T>,
}

struct Inner<T> {
    owner: Option<Token>,
    slot: Option<T>,
    waiters: VecDeque<Waiter<T>>,
    next_id: u64,
}

impl<T> Inner<T> {
    fn token(&mut self, kind: OpKind) -> Token {
        self.next_id = self.next_id.wrapping_add(1);
        Token {
            id: self.next_id,
            kind,
        }
    }

    /// Give `value` to the first waiter accepted by `eligible`. Returns the
    /// value if nobody took it; ownership is then left untouched.
    fn hand_off(&mut self, mut value: T, eligible: impl Fn(OpKind) -> bool) -> Option<T> {
        while let Some(pos) = self.waiters.iter().position(|w| eligible(w.token.kind)) {
            let Some(waiter) = self.waiters.remove(pos) else {
                break;
            };
            match waiter.tx.send(value) {
                Ok(()) => {
                    self.owner = Some(waiter.token);
                    return None;
                }
                // Waiter gave up; try the next one
                Err(v) => value = v,
            }
        }
        Some(value)
    }
}

/// Cooperative lock over one direction's resources
pub(crate) struct Block<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Block<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Inner {
                owner: None,
                slot: Some(value),
                waiters: VecDeque::new(),
                next_id: 0,
            }),
        }
    }

    /// Acquire the block if it is free.
    pub fn try_lock(&self, kind: OpKind) -> Option<BlockGuard<'_, T>> {
        let mut inner = self.inner.lock();
        if inner.owner.is_some() {
            return None;
        }
        let value = inner.slot.take()?;
        let token = inner.token(kind);
        inner.owner = Some(token);
        Some(BlockGuard {
            block: self,
            token,
            value: Some(value),
        })
    }

    /// Acquire the block, queueing behind earlier waiters if it is held.
    pub async fn lock(&self, kind: OpKind) -> Result<BlockGuard<'_, T>> {
        let pending = {
            let mut inner = self.inner.lock();
            let token = inner.token(kind);
            if inner.owner.is_none() {
                if let Some(value) = inner.slot.take() {
                    inner.owner = Some(token);
                    return Ok(BlockGuard {
                        block: self,
                        token,
                        value: Some(value),
                    });
                }
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(Waiter { token, tx });
            Pending {
                block: self,
                token,
                rx,
                done: false,
            }
        };
        pending.wait().await
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.inner.lock().owner.is_some()
    }

    #[cfg(test)]
    pub fn is_locked_by(&self, token: Token) -> bool {
        self.inner.lock().owner == Some(token)
    }

    /// Number of queued operations
    #[cfg(test)]
    pub fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Take the resources out of a free block for good.
    pub fn into_inner(self) -> Option<T> {
        let inner = self.inner.into_inner();
        if inner.owner.is_some() {
            return None;
        }
        inner.slot
    }

    fn release(&self, token: Token, value: T) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.owner, Some(token));
        if let Some(value) = inner.hand_off(value, |_| true) {
            inner.owner = None;
            inner.slot = Some(value);
        }
    }
}

/// A queued `lock` call. Dropping it (cancellation) puts back anything that
/// was handed to it in the meantime.
struct Pending<'a, T> {
    block: &'a Block<T>,
    token: Token,
    rx: oneshot::Receiver<T>,
    done: bool,
}

impl<'a, T> Pending<'a, T> {
    async fn wait(mut self) -> Result<BlockGuard<'a, T>> {
        let result = (&mut self.rx).await;
        self.done = true;
        match result {
            Ok(value) => Ok(BlockGuard {
                block: self.block,
                token: self.token,
                value: Some(value),
            }),
            Err(_) => Err(Error::Aborted),
        }
    }
}

impl<T> Drop for Pending<'_, T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.rx.close();
        if let Ok(value) = self.rx.try_recv() {
            self.block.release(self.token, value);
        }
    }
}

/// Exclusive access to one direction's resources
pub(crate) struct BlockGuard<'a, T> {
    block: &'a Block<T>,
    token: Token,
    value: Option<T>,
}

impl<'a, T> BlockGuard<'a, T> {
    #[cfg(test)]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Let queued operations accepted by `eligible` run, then take the block
    /// back. Returns immediately if none is queued.
    pub async fn yield_to(mut self, eligible: impl Fn(OpKind) -> bool) -> Result<BlockGuard<'a, T>> {
        let block = self.block;
        let token = self.token;
        let pending = {
            let mut inner = block.inner.lock();
            let Some(value) = self.value.take() else {
                return Err(Error::Aborted);
            };
            match inner.hand_off(value, &eligible) {
                Some(value) => {
                    drop(inner);
                    self.value = Some(value);
                    return Ok(self);
                }
                None => {
                    // Resume after the eligible operations at the head of the
                    // queue but ahead of anything that would interleave
                    let (tx, rx) = oneshot::channel();
                    let pos = inner
                        .waiters
                        .iter()
                        .position(|w| !eligible(w.token.kind))
                        .unwrap_or(inner.waiters.len());
                    inner.waiters.insert(pos, Waiter { token, tx });
                    Pending {
                        block,
                        token,
                        rx,
                        done: false,
                    }
                }
            }
        };
        pending.wait().await
    }
}

impl<T> Deref for BlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("guard holds its resources until dropped")
    }
}

impl<T> DerefMut for BlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("guard holds its resources until dropped")
    }
}

impl<T> Drop for BlockGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.block.release(self.token, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_try_lock_is_exclusive() {
        let block = Block::new(0u32);
        let guard = block.try_lock(OpKind::Read).unwrap();
        assert!(block.is_locked());
        assert!(block.is_locked_by(guard.token()));
        assert!(block.try_lock(OpKind::Write).is_none());
        drop(guard);
        assert!(!block.is_locked());
        assert!(block.try_lock(OpKind::Write).is_some());
    }

    #[test]
    fn test_resource_persists_across_guards() {
        let block = Block::new(Vec::<u8>::new());
        block.try_lock(OpKind::Write).unwrap().push(1);
        block.try_lock(OpKind::Write).unwrap().push(2);
        assert_eq!(block.into_inner().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_waiters_resume_in_fifo_order() {
        let block = Arc::new(Block::new(Vec::<u32>::new()));
        let guard = block.try_lock(OpKind::Read).unwrap();

        let mut handles = Vec::new();
        for i in 0..4u32 {
            let b = block.clone();
            handles.push(tokio::spawn(async move {
                let mut g = b.lock(OpKind::Read).await.unwrap();
                g.push(i);
            }));
            // make sure task i is queued before task i + 1
            while block.waiting() < (i + 1) as usize {
                tokio::task::yield_now().await;
            }
        }

        // A fresh try_lock must not overtake the queue
        drop(guard);
        assert!(block.try_lock(OpKind::Read).is_none());

        for h in handles {
            h.await.unwrap();
        }
        let block = Arc::try_unwrap(block).ok().unwrap();
        assert_eq!(block.into_inner().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_yield_to_only_lets_eligible_in() {
        let block = Arc::new(Block::new(Vec::<&'static str>::new()));
        let mut guard = block.lock(OpKind::Write).await.unwrap();
        guard.push("frame 1");

        let writer = {
            let block = block.clone();
            tokio::spawn(async move {
                block.lock(OpKind::Write).await.unwrap().push("other message");
            })
        };
        while block.waiting() < 1 {
            tokio::task::yield_now().await;
        }
        let pong = {
            let block = block.clone();
            tokio::spawn(async move {
                block.lock(OpKind::Reply).await.unwrap().push("pong");
            })
        };
        while block.waiting() < 2 {
            tokio::task::yield_now().await;
        }

        let mut guard = guard.yield_to(OpKind::is_control).await.unwrap();
        guard.push("frame 2");
        drop(guard);

        pong.await.unwrap();
        writer.await.unwrap();
        let block = Arc::try_unwrap(block).ok().unwrap();
        assert_eq!(
            block.into_inner().unwrap(),
            vec!["frame 1", "pong", "frame 2", "other message"]
        );
    }

    #[tokio::test]
    async fn test_yield_without_waiters_keeps_lock() {
        let block = Block::new(1u8);
        let guard = block.lock(OpKind::Write).await.unwrap();
        let token = guard.token();
        let guard = guard.yield_to(OpKind::is_control).await.unwrap();
        assert!(block.is_locked_by(token));
        assert_eq!(*guard, 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_lose_resource() {
        let block = Block::new(7u32);
        let guard = block.try_lock(OpKind::Read).unwrap();

        // queue a waiter, then drop it
        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), block.lock(OpKind::Close)).await;
        assert!(timed_out.is_err());
        assert_eq!(block.waiting(), 1);

        drop(guard);
        let guard = block.try_lock(OpKind::Read).unwrap();
        assert_eq!(*guard, 7);
        assert_eq!(block.waiting(), 0);
    }
}
