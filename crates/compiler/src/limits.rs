//! Fixed tuning constants carried over from the reference engine's
//! `core.h`, kept as named constants rather than magic numbers.

/// `cGAB_SEND_CACHE_LEN`: must be a power of two, at least 4.
pub const GAB_SEND_CACHE_LEN: usize = 4;
/// `GAB_LOCAL_MAX`
pub const GAB_LOCAL_MAX: usize = 256;
/// `GAB_UPVALUE_MAX`
pub const GAB_UPVALUE_MAX: usize = 128;
/// `GAB_ARG_MAX`
pub const GAB_ARG_MAX: usize = 64;
/// `GAB_RET_MAX`
pub const GAB_RET_MAX: usize = 128;
/// `cGAB_FRAMES_MAX`
pub const GAB_FRAMES_MAX: usize = 32;
/// `cGAB_STACK_MAX = FRAMES_MAX * 32`
pub const GAB_STACK_MAX: usize = GAB_FRAMES_MAX * 32;
/// `cGAB_FUNCTION_DEF_NESTING_MAX`
pub const GAB_FUNCTION_DEF_NESTING_MAX: usize = 64;
/// `GAB_PVEC_BITS` / `GAB_PVEC_SIZE`: the persistent record trie's
/// branching factor.
pub const GAB_PVEC_BITS: u32 = 5;
pub const GAB_PVEC_SIZE: usize = 1 << GAB_PVEC_BITS;
/// `cGAB_DEFAULT_NJOBS`
pub const GAB_DEFAULT_NJOBS: usize = 8;
/// `cGAB_WORKER_LOCALQUEUE_MAX`
pub const GAB_WORKER_LOCALQUEUE_MAX: usize = 32;
