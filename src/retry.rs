//! Bounded exponential retry for inventory reads and upstream token exchanges.

// crates.io
use rand::Rng;
use tokio::time;
// self
use crate::{_prelude::*, metrics};

/// Default number of attempts granted to an operation.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;
/// Default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Default upper bound applied to exponential backoff growth.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Supported jitter strategies for the backoff schedule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Jitter {
	/// Deterministic backoff schedule.
	#[default]
	None,
	/// Randomize each delay within 80–100% of the computed backoff.
	Full,
}

/// Retry configuration; attempts are counted from 1.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
	/// Attempts granted before giving up; negative means unbounded.
	pub max_attempts: i64,
	/// Delay before the first retry.
	pub initial_delay: Duration,
	/// Upper bound applied to exponential backoff growth.
	pub max_delay: Duration,
	/// Strategy used to randomize the computed backoff.
	pub jitter: Jitter,
}
impl RetryPolicy {
	/// Compute the delay scheduled after the `attempt`-th failure.
	pub fn backoff(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(32);
		let base = self
			.initial_delay
			.checked_mul(1_u32 << exponent.min(31))
			.unwrap_or(self.max_delay)
			.min(self.max_delay);

		match self.jitter {
			Jitter::None => base,
			Jitter::Full => {
				let mut rng = rand::rng();
				let factor = rng.random_range(0.8..=1.0);

				base.mul_f64(factor)
			},
		}
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: DEFAULT_MAX_ATTEMPTS,
			initial_delay: DEFAULT_INITIAL_DELAY,
			max_delay: DEFAULT_MAX_DELAY,
			jitter: Jitter::None,
		}
	}
}

/// Description of a retryable operation.
#[derive(Clone, Copy, Debug)]
pub struct Operation<'a> {
	/// Human-readable label used in errors, logs, and the failure counter.
	pub description: &'a str,
	/// Retry policy applied to the operation.
	pub policy: RetryPolicy,
}
impl<'a> Operation<'a> {
	/// Operation with the default policy.
	pub fn new(description: &'a str) -> Self {
		Self { description, policy: RetryPolicy::default() }
	}
}

/// Run `attempt` under the operation's retry policy.
///
/// Non-retryable errors are returned unwrapped. Exhausting the attempt budget
/// yields [`Error::RetryExhausted`] carrying the last error; cancellation
/// mid-sleep yields [`Error::Canceled`].
pub async fn run<T, F, Fut, C>(
	ctx: &CancellationToken,
	op: Operation<'_>,
	is_retryable: C,
	mut attempt: F,
) -> Result<T>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T>>,
	C: Fn(&Error) -> bool,
{
	let mut attempts = 0_u32;

	loop {
		if ctx.is_cancelled() {
			return Err(Error::Canceled { desc: op.description.to_owned() });
		}

		attempts += 1;

		let err = match attempt().await {
			Ok(value) => return Ok(value),
			Err(err) => err,
		};

		metrics::record_retry_failure(op.description);

		if !is_retryable(&err) {
			return Err(err);
		}
		if op.policy.max_attempts >= 0 && i64::from(attempts) >= op.policy.max_attempts {
			return Err(Error::RetryExhausted {
				desc: op.description.to_owned(),
				source: Box::new(err),
			});
		}

		let delay = op.policy.backoff(attempts);

		tracing::debug!(
			operation = op.description,
			attempt = attempts,
			?delay,
			error = %err,
			"retrying after failure"
		);

		tokio::select! {
			_ = time::sleep(delay) => {},
			_ = ctx.cancelled() =>
				return Err(Error::Canceled { desc: op.description.to_owned() }),
		}
	}
}
