#![deny(missing_docs)]
//! Test utilities for ferry.

/// Enable tracing with the RUST_LOG environment variable.
///
/// This is intended to be used in tests, so it defaults to DEBUG level.
pub fn enable_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::DEBUG.into())
                .from_env_lossy(),
        )
        .try_init();
}

/// Generate some random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::Rng;
    let mut out = vec![0; len];
    rand::thread_rng().fill(&mut out[..]);
    out
}

pub mod id;

/// Repeatedly run a block of code until it breaks out of the loop or a
/// timeout elapses. The default timeout is 1 s, with a 10 ms pause between
/// iterations.
///
/// ```ignore
/// iter_check!({
///     if pool.state().is_finished() {
///         break;
///     }
/// });
/// ```
#[macro_export]
macro_rules! iter_check {
    ($timeout_ms:literal, $code:block) => {{
        let deadline = ::std::time::Instant::now()
            + ::std::time::Duration::from_millis($timeout_ms);
        loop {
            $code

            if ::std::time::Instant::now() > deadline {
                panic!("iter_check timed out after {} ms", $timeout_ms);
            }
            ::tokio::time::sleep(::std::time::Duration::from_millis(10))
                .await;
        }
    }};
    ($code:block) => {
        $crate::iter_check!(1000, $code)
    };
}
