//! Parameter construction macros.

/// Build a [`Params`](crate::db::Params) record from `name => value` pairs.
///
/// Values are converted with `Into<Param>`; later pairs replace earlier ones
/// with the same name.
///
/// # Example
///
/// ```ignore
/// let args = params! {
///     "user_id" => user_id,
///     "roles" => vec!["admin", "user"],
/// };
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::db::Params::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {
        $crate::db::Params::new()
            $(.bind($name, $value))+
    };
}
