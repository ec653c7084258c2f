/// Unwraps a `Result` or returns an already failed [`Request`](crate::request::Request).
macro_rules! try_request {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return crate::request::Request::ready(Err(e)),
        }
    };
}
