/// Construct a metric, bind it to a local of the same name and register it with the registry.
///
/// ```ignore
/// register!(submissions, "Number of anchor submissions", Counter::default(), sub_registry);
/// ```
#[macro_export]
macro_rules! register {
    ($name:ident, $help:expr, $metric:expr, $registry:expr) => {
        let $name = $metric;
        $registry.register(stringify!($name), $help, $name.clone());
    };
}
