/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Server-wide token bucket for inbound datagrams.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;

use super::config::RateLimitConfig;
use super::types::{ErrorCode, StructuredError};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by every receive path of one server.
///
/// Holds up to `burst_size` tokens and refills at `requests_per_second`.
/// Each inbound request takes one token; with none left the request is
/// refused with `RESOURCE_LIMIT_EXCEEDED`.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    capacity: f64,
    refill_per_sec: f64,
    enabled: bool,
}

impl RateLimiter {
    /// Creates a full bucket from `[rate_limit]`.
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = f64::from(config.burst_size);
        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_per_sec: f64::from(config.requests_per_second),
            enabled: config.enabled,
        }
    }

    /// Takes one token.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ResourceLimitExceeded`] carrying the suggested wait in
    /// `details.retry_after_ms`.
    pub fn acquire(&self) -> Result<(), StructuredError> {
        if !self.enabled {
            return Ok(());
        }
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let wait = self.wait_for_token(&bucket);
        Err(StructuredError::new(
            ErrorCode::ResourceLimitExceeded,
            "Request rate limit exceeded",
        )
        .with_field("rate_limit")
        .with_details(json!({ "retry_after_ms": u64::try_from(wait.as_millis()).unwrap_or(u64::MAX) }))
        .with_constraints(json!({
            "requests_per_second": self.refill_per_sec,
            "burst_size": self.capacity,
        })))
    }

    /// Whether limiting is on.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn wait_for_token(&self, bucket: &Bucket) -> Duration {
        if bucket.tokens >= 1.0 {
            Duration::ZERO
        } else if self.refill_per_sec <= 0.0 {
            Duration::MAX
        } else {
            Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        bucket.tokens = elapsed
            .mul_add(self.refill_per_sec, bucket.tokens)
            .min(self.capacity);
    }
}
