/// Runs `attempt` until it succeeds, fails with a non-retryable error, or
/// `retries` additional attempts have been spent.
///
/// `attempt` receives the zero-based attempt index.
pub fn with_retries<T, E, F, P>(retries: u32, mut attempt: F, retryable: P) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    P: Fn(&E) -> bool,
{
    let mut index = 0;
    loop {
        match attempt(index) {
            Ok(value) => return Ok(value),
            Err(e) if index < retries && retryable(&e) => index += 1,
            Err(e) => return Err(e),
        }
    }
}
