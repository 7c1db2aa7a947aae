// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::future::Future;
use std::time::Duration;

use rand::{thread_rng, Rng};
use tonic::Code;

const INTERVAL_DURATION: Duration = Duration::from_millis(20);
const MAX_RETRIES: u32 = 3;
const MAX_BACKOFF_DURATION: Duration = Duration::from_secs(5);

pub fn status_code_is_retryable(code: Code) -> bool {
    matches!(
        code,
        Code::Aborted
            | Code::Cancelled
            | Code::Internal
            | Code::ResourceExhausted
            | Code::Unavailable
            | Code::Unknown
    )
}

/// Retry a gRPC client operation using jittered exponential back-off between attempts.
pub async fn retry_call<T, E, C, F, G, Fut>(client: C, f: F, is_retryable: G) -> Result<T, E>
where
    C: Clone,
    F: Fn(C) -> Fut,
    G: Fn(&E) -> bool,
    Fut: Future<Output = Result<T, E>>,
{
    let mut num_retries = 0;
    let last_error = loop {
        // Delay before the next send attempt if this is a retry.
        if num_retries > 0 {
            let multiplier = thread_rng().gen_range(0..2_u32.pow(num_retries) + 1);
            let sleep_time = (INTERVAL_DURATION * multiplier).min(MAX_BACKOFF_DURATION);
            tokio::time::sleep(sleep_time).await;
        }

        let last_error = match f(client.clone()).await {
            Ok(r) => return Ok(r),
            Err(err) => {
                if is_retryable(&err) {
                    err
                } else {
                    return Err(err);
                }
            }
        };

        num_retries += 1;

        if num_retries >= MAX_RETRIES {
            break last_error;
        }
    };

    Err(last_error)
}
