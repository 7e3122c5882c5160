//! The interface between the scheduler and the platform it runs on.

/// Implemented by a port on a "traits type" (usually a zero-sized type) to
/// provide the critical section that guards the scheduler state.
///
/// The critical section is called *CPU Lock*. On a bare-metal target, it's
/// typically realized by masking the interrupt that drives the tick source. A
/// hosted port may use a mutex instead.
///
/// # Safety
///
/// While CPU Lock is active, no other context may observe CPU Lock to be
/// inactive or enter it. The implementation must uphold this for all contexts
/// that call into the scheduler, including the tick source.
pub unsafe trait PortThreading: Sized + 'static {
    /// Attempt to enter CPU Lock. Returns `false` if the calling context is
    /// already holding CPU Lock.
    ///
    /// If another context holds CPU Lock, this method waits until CPU Lock is
    /// released.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the scheduler.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave CPU Lock.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the scheduler. CPU Lock must be held by the
    /// calling context.
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether the calling context holds CPU Lock.
    fn is_cpu_lock_active() -> bool;
}
