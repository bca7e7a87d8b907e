// SPDX-License-Identifier: CEPL-1.0

/// Passes `result` through, running `cleanup` first when it is an error.
/// Lets a multi-step constructor free what it already built before bailing.
pub fn on_error<T, E>(result: Result<T, E>, cleanup: impl FnOnce()) -> Result<T, E> {
    if result.is_err() {
        cleanup();
    }
    result
}
