//! Busy-wait delays for bring-up, calibrated to nothing but the CPU.

#[inline]
pub fn delay_us(us: u32) {
    for _ in 0..(us as u64 * 100) {
        core::hint::spin_loop();
    }
}

#[inline]
pub fn delay_ms(ms: u32) {
    delay_us(ms.saturating_mul(1000));
}
