//! Result codes and per-operation error types
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use wstimer::ResultCode;
            /// assert_eq!(ResultCode::InvalidReceiver.as_str(), "InvalidReceiver");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }

        impl fmt::Display for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the scheduler can report.
    ///
    /// Failure codes are negative and follow the μITRON numbering of their
    /// closest equivalents.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// The specified timer handle or delivery token doesn't refer to the
        /// timer it was issued for anymore. The timer has completed and its
        /// record might have been reused by another request.
        NoAccess = -18,
        /// The current context disallows the operation, e.g., because the
        /// caller already holds CPU Lock.
        BadContext = -25,
        /// The static timer pool is empty, and no overflow record could be
        /// allocated.
        ResourceExhausted = -33,
        /// The receiver tasklet of the event doesn't exist.
        InvalidReceiver = -42,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl fmt::Display for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

define_error! {
    mod cpu_lock_error {}
    /// Error type for [`lock_cpu`] and the operations that only need to enter
    /// CPU Lock, such as [`TimerSys::on_tick_advance`].
    ///
    /// [`lock_cpu`]: crate::lock_cpu
    /// [`TimerSys::on_tick_advance`]: crate::TimerSys::on_tick_advance
    pub enum CpuLockError {
        /// CPU Lock is already held by the caller.
        BadContext,
    }
}

define_error! {
    mod request_timer_error {}
    /// Error type for [`TimerSys::request_at`] and its variants.
    ///
    /// [`TimerSys::request_at`]: crate::TimerSys::request_at
    pub enum RequestTimerError: CpuLockError {
        /// CPU Lock is already held by the caller.
        BadContext,
        /// The receiver tasklet doesn't exist. No timer record was consumed.
        InvalidReceiver,
        /// No timer record could be obtained.
        ResourceExhausted,
    }
}

define_error! {
    mod cancel_timer_error {}
    /// Error type for [`TimerSys::cancel`] and [`TimerSys::cancel_timer`].
    ///
    /// [`TimerSys::cancel`]: crate::TimerSys::cancel
    /// [`TimerSys::cancel_timer`]: crate::TimerSys::cancel_timer
    pub enum CancelTimerError: CpuLockError {
        /// CPU Lock is already held by the caller.
        BadContext,
        /// The handle is stale. The timer has already been returned to the
        /// pool (a one-shot timer delivered, or a timer cancelled earlier).
        NoAccess,
    }
}

define_error! {
    mod complete_delivery_error {}
    /// Error type for [`TimerSys::on_delivery_complete`].
    ///
    /// [`TimerSys::on_delivery_complete`]: crate::TimerSys::on_delivery_complete
    pub enum CompleteDeliveryError: CpuLockError {
        /// CPU Lock is already held by the caller.
        BadContext,
        /// The token doesn't refer to a timer record that is in flight.
        NoAccess,
    }
}
