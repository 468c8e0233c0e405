use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    time::{SystemTime, UNIX_EPOCH},
};

use futures::FutureExt;

/// Wall-clock milliseconds since the unix epoch, for reporting timestamps.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Runs `fut`, turning a panic inside it into an `Err` carrying the panic message.
pub(crate) async fn catch_panic<F, T>(fut: F) -> Result<T, String>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(fut).catch_unwind().await.map_err(panic_message)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.to_owned()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn catch_panic_keeps_the_message() {
        let res: Result<(), _> = catch_panic(async { panic!("node client blew up") }).await;
        assert_eq!(res.unwrap_err(), "node client blew up");

        let res = catch_panic(async { 7 }).await;
        assert_eq!(res, Ok(7));
    }
}
