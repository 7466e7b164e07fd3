//! See [`TokenBucket`].

use {
    core::time::Duration,
    derive_more::{Display, Error},
};

/// Byte budget which refills over time, capping how fast a connection sends.
///
/// # Examples
///
/// ```
/// # use {carrier::limit::TokenBucket, core::time::Duration};
/// let mut bucket = TokenBucket::new(1000);
/// bucket.consume(600).unwrap();
/// assert_eq!(400, bucket.rem());
/// bucket.consume(600).unwrap_err();
///
/// // 2000 bytes per second for 100ms
/// bucket.refill_for(2000, Duration::from_millis(100));
/// assert_eq!(600, bucket.rem());
///
/// // never refills past the cap
/// bucket.refill_for(2000, Duration::from_secs(10));
/// assert_eq!(1000, bucket.rem());
/// ```
#[derive(Debug, Clone)]
pub struct TokenBucket {
    cap: usize,
    rem: usize,
    // sub-token refill left over from the last `refill_for`
    carry: f64,
}

/// Attempted to [`TokenBucket::consume`] more tokens than were left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
#[display("not enough tokens")]
pub struct NotEnoughTokens;

impl TokenBucket {
    /// Creates a full bucket holding up to `cap` tokens.
    #[must_use]
    pub const fn new(cap: usize) -> Self {
        Self {
            cap,
            rem: cap,
            carry: 0.0,
        }
    }

    /// Gets the maximum number of tokens.
    #[must_use]
    pub const fn cap(&self) -> usize {
        self.cap
    }

    /// Gets the number of tokens left.
    #[must_use]
    pub const fn rem(&self) -> usize {
        self.rem
    }

    /// Changes the maximum number of tokens, dropping any above the new cap.
    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap;
        self.rem = self.rem.min(cap);
    }

    /// Takes `n` tokens out of the bucket.
    ///
    /// # Errors
    ///
    /// Errors if fewer than `n` tokens are left, in which case nothing is
    /// taken.
    pub const fn consume(&mut self, n: usize) -> Result<(), NotEnoughTokens> {
        if let Some(rem) = self.rem.checked_sub(n) {
            self.rem = rem;
            Ok(())
        } else {
            Err(NotEnoughTokens)
        }
    }

    /// Takes up to `n` tokens out of the bucket, stopping at zero.
    pub const fn consume_saturating(&mut self, n: usize) {
        self.rem = self.rem.saturating_sub(n);
    }

    /// Puts back the tokens that `rate` tokens per second would produce over
    /// `elapsed`.
    pub fn refill_for(&mut self, rate: u32, elapsed: Duration) {
        let tokens = f64::from(rate).mul_add(elapsed.as_secs_f64(), self.carry);
        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss,
            reason = "`tokens` is non-negative and clamped to the cap below"
        )]
        let whole = tokens.floor().min(self.cap as f64) as usize;
        self.carry = tokens - tokens.floor();
        self.rem = self.rem.saturating_add(whole).min(self.cap);
        if self.rem == self.cap {
            self.carry = 0.0;
        }
    }

    /// Fills the bucket back up to its cap.
    pub const fn refill(&mut self) {
        self.rem = self.cap;
    }
}
