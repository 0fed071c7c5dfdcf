/// Defines the `Counter` enum together with a stable name for every
/// variant and a table of all variants, in declaration order.
macro_rules! counters {
    ($($(#[$meta:meta])* $variant:ident => $name:literal,)*) => {
        /// A protocol statistic maintained in [`TcpStats`](crate::tcp::TcpStats).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Counter {
            $($(#[$meta])* $variant,)*
        }

        impl Counter {
            pub const ALL: &'static [Counter] = &[$(Counter::$variant,)*];

            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Counter::$variant => $name,)*
                }
            }
        }
    };
}
