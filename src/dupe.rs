//! A marker trait for cheap, `Arc`-backed clones.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Types that are cheap to duplicate (an `Arc` bump, a channel handle clone)
/// as opposed to [`Clone`], which may be expensive or even undesired for
/// some types. Spelled out so that call sites reading `.dupe()` can assume
/// O(1) cost without checking the type.
pub trait Dupe {
    /// Cheaply duplicate `self`.
    fn dupe(&self) -> Self;
}

impl<T> Dupe for Arc<T> {
    #[inline]
    fn dupe(&self) -> Self {
        Arc::clone(self)
    }
}

impl<T> Dupe for mpsc::Sender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl<T> Dupe for mpsc::UnboundedSender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl<T: Clone> Dupe for watch::Receiver<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}
