//! A semaphore whose live limit can move while permits are out.
//!
//! The limiter admits up to `current_limit` concurrent users, where
//! `current_limit` starts at `initial_limit` and can be raised or lowered
//! at runtime without cancelling anyone already admitted. Lowering below
//! the number of permits currently out records a debt that is settled as
//! holders release: their permits are swallowed instead of returned.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

struct Counts {
	current: usize,
	debt: usize,
}

/// The admission semaphore.
pub struct Limiter {
	semaphore: Arc<Semaphore>,
	state: Arc<Mutex<Counts>>,
	initial: usize,
}

/// An admission, released on drop.
pub struct Permit {
	inner: Option<OwnedSemaphorePermit>,
	state: Arc<Mutex<Counts>>,
}

impl Limiter {
	/// A limiter admitting up to `initial_limit` users; the live limit can
	/// never be raised past this.
	#[must_use]
	pub fn new(initial_limit: usize) -> Limiter {
		Limiter {
			semaphore: Arc::new(Semaphore::new(initial_limit)),
			state: Arc::new(Mutex::new(Counts {
				current: initial_limit,
				debt: 0,
			})),
			initial: initial_limit,
		}
	}

	/// The fixed ceiling.
	#[must_use]
	pub fn initial_limit(&self) -> usize {
		self.initial
	}

	/// The live limit.
	#[must_use]
	pub fn current_limit(&self) -> usize {
		self.lock().current
	}

	/// Acquires a permit, waiting at most `deadline`. `None` on timeout or
	/// when the limiter is being torn down.
	pub async fn take(&self, deadline: Duration) -> Option<Permit> {
		let inner = timeout(deadline, self.semaphore.clone().acquire_owned())
			.await
			.ok()?
			.ok()?;
		Some(Permit {
			inner: Some(inner),
			state: self.state.clone(),
		})
	}

	/// Moves the live limit to `target`, clamped to `0..=initial_limit`.
	/// In-flight holders are never cancelled; shrinking past them defers
	/// the difference until they release.
	pub fn set_limit(&self, target: usize) {
		let target = target.min(self.initial);
		let mut state = self.lock();
		if target > state.current {
			let mut grow = target - state.current;
			// cancel outstanding debt before handing out fresh permits
			let cancelled = grow.min(state.debt);
			state.debt -= cancelled;
			grow -= cancelled;
			self.semaphore.add_permits(grow);
		} else {
			let mut shrink = state.current - target;
			while shrink > 0 {
				match self.semaphore.try_acquire() {
					Ok(permit) => {
						permit.forget();
						shrink -= 1;
					}
					Err(_) => break,
				}
			}
			state.debt += shrink;
		}
		state.current = target;
	}

	/// Raises the live limit by `n`, saturating at the initial limit.
	pub fn raise(&self, n: usize) {
		let target = {
			let state = self.lock();
			state.current.saturating_add(n)
		};
		self.set_limit(target);
	}

	/// Lowers the live limit by `n`, saturating at zero.
	pub fn lower(&self, n: usize) {
		let target = {
			let state = self.lock();
			state.current.saturating_sub(n)
		};
		self.set_limit(target);
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Counts> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl Drop for Permit {
	fn drop(&mut self) {
		let mut state = self
			.state
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		if state.debt > 0 {
			state.debt -= 1;
			if let Some(inner) = self.inner.take() {
				// settle the debt: swallow this permit instead of
				// returning it
				inner.forget();
			}
		}
	}
}
