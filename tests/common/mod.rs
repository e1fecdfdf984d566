//! Common test utilities

#![allow(dead_code)]

pub mod fake_linknx;
pub mod test_fixtures;

use std::future::Future;
use std::time::Duration;

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let wait = async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("condition not reached in time");
}
