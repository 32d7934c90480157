use core::convert::Infallible;

#[cfg(feature = "embedded-hal")]
use embedded_hal::digital::{
    ErrorType, InputPin as InputPinHal, OutputPin as OutputPinHal,
    StatefulOutputPin as StatefulOutputPinHal,
};

use super::{GpioPort, Level};

#[cfg(feature = "embedded-hal")]
impl ErrorType for GpioPort {
    type Error = Infallible;
}

#[cfg(feature = "embedded-hal")]
impl InputPinHal for GpioPort {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.value() == Level::High)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(self.value() == Level::Low)
    }
}

#[cfg(feature = "embedded-hal")]
impl OutputPinHal for GpioPort {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set_value(Level::Low);

        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set_value(Level::High);

        Ok(())
    }
}

#[cfg(feature = "embedded-hal")]
impl StatefulOutputPinHal for GpioPort {
    // GPLEV reflects the driven level while the pin is an output
    fn is_set_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.value() == Level::High)
    }

    fn is_set_low(&mut self) -> Result<bool, Self::Error> {
        Ok(self.value() == Level::Low)
    }
}

#[cfg(feature = "embedded-hal-0")]
impl embedded_hal_0::digital::v2::InputPin for GpioPort {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Self::Error> {
        Ok(self.value() == Level::High)
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        Ok(self.value() == Level::Low)
    }
}

#[cfg(feature = "embedded-hal-0")]
impl embedded_hal_0::digital::v2::OutputPin for GpioPort {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set_value(Level::Low);

        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set_value(Level::High);

        Ok(())
    }
}

#[cfg(all(test, feature = "embedded-hal"))]
mod tests {
    use std::sync::Arc;

    use embedded_hal::digital::{InputPin, OutputPin, StatefulOutputPin};

    use crate::gpio::fake::FakeRegisters;
    use crate::gpio::{Gpio, Mode, PullUpDown, Sysfs};

    #[test]
    fn toggle_output() {
        let gpio = Gpio::with_parts(Arc::new(FakeRegisters::new()), Sysfs::new(), None);
        let mut port = gpio.get(18, Mode::Output, PullUpDown::Off).unwrap();

        OutputPin::set_high(&mut port).unwrap();
        assert!(StatefulOutputPin::is_set_high(&mut port).unwrap());

        StatefulOutputPin::toggle(&mut port).unwrap();
        assert!(InputPin::is_low(&mut port).unwrap());
    }
}
