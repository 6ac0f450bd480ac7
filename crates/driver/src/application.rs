//! Application callbacks

/// User-facing surface of the class driver
pub trait Application {
    /// The attached device cannot be driven (no usable interface, or more than one
    /// logical unit)
    fn device_not_supported(&mut self);

    /// Called on every tick once the device is ready
    ///
    /// `0` keeps the device in the ready state, `1` asks for de-initialization;
    /// other values are reserved.
    fn user_application(&mut self) -> u8;

    /// A text response arrived from the vendor serial function
    fn serial_response(&mut self, _text: &str) {}
}
