use rand::RngCore;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn next_u32() -> u32;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u32() -> u32 {
        rand::thread_rng().next_u32()
    }
}

/// A source id for message headers. 0 is avoided because devices treat it as 'do not reply
///  by unicast'.
pub fn new_source<R: Random>() -> u32 {
    loop {
        let candidate = R::next_u32();
        if candidate != 0 {
            return candidate;
        }
    }
}
