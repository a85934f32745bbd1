/*!
# linac-tuneup_interface

Interface definition between the linac tune-up engine and its external collaborators:
 * the control system, reached through named process variables (PVs),
 * the on-line beam dynamics model ([OnlineModel]),
 * the XML state document ([DataAdaptor]).

Control system channels are typed by a unique identifier (UID) that carries
the PV name suffix and the data type of the channel:
```
use linac_tuneup_interface::{Channel, CtlAmpSet};

let amp: Channel<CtlAmpSet> = Channel::new("DTL_LLRF:FCM1");
assert_eq!(amp.pv(), "DTL_LLRF:FCM1:CtlAmpSet");
```
*/

use std::{any::type_name, marker::PhantomData};

mod data;
pub use data::Data;
pub mod filing;
pub mod model;
pub mod units;
pub mod xml;

pub use model::{EnvelopeState, ModelError, OnlineModel, ProbeState, Trajectory};
pub use xml::{DataAdaptor, XmlError};

pub type Assoc<U> = <U as UniqueIdentifier>::DataType;

/// Defines the PV suffix and the data type associated with a control system channel
pub trait UniqueIdentifier: Send + Sync {
    /// PV name suffix appended to the device prefix
    const SUFFIX: &'static str;
    type DataType: ChannelValue;
}

/// Conversion of a channel value to and from the raw PV value
pub trait ChannelValue: Send + Sync + Copy + std::fmt::Debug {
    fn from_raw(raw: f64) -> Self;
    fn into_raw(self) -> f64;
}
impl ChannelValue for f64 {
    #[inline]
    fn from_raw(raw: f64) -> Self {
        raw
    }
    #[inline]
    fn into_raw(self) -> f64 {
        self
    }
}
impl ChannelValue for bool {
    #[inline]
    fn from_raw(raw: f64) -> Self {
        raw != 0.
    }
    #[inline]
    fn into_raw(self) -> f64 {
        if self {
            1.
        } else {
            0.
        }
    }
}

macro_rules! channels {
    ($($(#[$meta:meta])* $name:ident: $ty:ty = $suffix:expr),* $(,)?) => {
        $(
            $(#[$meta])*
            pub enum $name {}
            impl UniqueIdentifier for $name {
                const SUFFIX: &'static str = $suffix;
                type DataType = $ty;
            }
        )*
    };
}
channels! {
    /// Cavity amplitude set-point (arbitrary controller units)
    CtlAmpSet: f64 = ":CtlAmpSet",
    /// Cavity phase set-point (degrees)
    CtlPhaseSet: f64 = ":CtlPhaseSet",
    /// Cavity net RF power (kW)
    NetPwr: f64 = ":NetPwr",
    /// Cavity blank-beam flag
    BlankBeam: bool = ":BlnkBeam",
    /// BPM averaged phase (degrees)
    BpmPhaseAvg: f64 = ":phaseAvg",
    /// BPM averaged amplitude (a.u.)
    BpmAmplitudeAvg: f64 = ":amplitudeAvg",
    /// BPM averaged horizontal position (mm)
    BpmXAvg: f64 = ":xAvg",
    /// BPM averaged vertical position (mm)
    BpmYAvg: f64 = ":yAvg",
    /// Ring beam revolution frequency (Hz)
    RingFrequency: f64 = "",
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("cannot connect to PV {0}")]
    Connect(String),
    #[error("cannot read PV {0}")]
    Read(String),
    #[error("cannot write {value} to PV {pv}")]
    Write { pv: String, value: f64 },
}

/// Live control system access by PV name
///
/// Implementations must be usable from the scan worker threads.
pub trait ControlSystem: Send + Sync {
    /// Connects the channel, failing if it is not reachable within a small wait
    fn connect(&self, pv: &str) -> Result<(), ChannelError>;
    /// Reads the current value of a PV
    fn get(&self, pv: &str) -> Result<f64, ChannelError>;
    /// Writes a value to a PV
    fn put(&self, pv: &str, value: f64) -> Result<(), ChannelError>;
}

/// A typed control system channel
pub struct Channel<U: UniqueIdentifier> {
    pv: String,
    uid: PhantomData<U>,
}
impl<U: UniqueIdentifier> Clone for Channel<U> {
    fn clone(&self) -> Self {
        Self {
            pv: self.pv.clone(),
            uid: PhantomData,
        }
    }
}
impl<U: UniqueIdentifier> std::fmt::Debug for Channel<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("uid", &trim_type_name::<U>())
            .field("pv", &self.pv)
            .finish()
    }
}
impl<U: UniqueIdentifier> Channel<U> {
    /// Creates a channel from a device prefix and the UID suffix
    pub fn new<S: AsRef<str>>(prefix: S) -> Self {
        Self {
            pv: format!("{}{}", prefix.as_ref(), U::SUFFIX),
            uid: PhantomData,
        }
    }
    /// Creates a channel from a complete PV name
    pub fn with_pv<S: Into<String>>(pv: S) -> Self {
        Self {
            pv: pv.into(),
            uid: PhantomData,
        }
    }
    pub fn pv(&self) -> &str {
        &self.pv
    }
    pub fn connect(&self, cs: &dyn ControlSystem) -> Result<(), ChannelError> {
        cs.connect(&self.pv)
    }
    /// Reads the channel value
    pub fn get(&self, cs: &dyn ControlSystem) -> Result<Assoc<U>, ChannelError> {
        cs.get(&self.pv).map(<Assoc<U> as ChannelValue>::from_raw)
    }
    /// Reads the channel into a [Data] container
    pub fn read(&self, cs: &dyn ControlSystem) -> Result<Data<U>, ChannelError> {
        self.get(cs).map(Data::new)
    }
    /// Writes the channel value
    pub fn put(&self, cs: &dyn ControlSystem, value: Assoc<U>) -> Result<(), ChannelError> {
        cs.put(&self.pv, value.into_raw())
    }
}

use log::{info, warn};

/// Pretty prints error message
pub fn print_info<S: Into<String>>(msg: S, e: Option<&dyn std::error::Error>) {
    if let Some(e) = e {
        let mut msg: Vec<String> = vec![msg.into()];
        msg.push(format!("{}", e));
        let mut current = e.source();
        while let Some(cause) = current {
            msg.push(format!("{}", cause));
            current = cause.source();
        }
        warn!("{}", msg.join("\n .due to: "))
    } else {
        info!("{}", msg.into())
    }
}

pub fn trim_type_name<T>() -> String {
    fn trim(name: &str) -> String {
        if let Some((prefix, suffix)) = name.split_once('<') {
            let generics: Vec<_> = suffix.split(',').map(trim).collect();
            format!("{}<{}", trim(prefix), generics.join(","))
        } else if let Some((_, suffix)) = name.rsplit_once("::") {
            suffix.into()
        } else {
            name.into()
        }
    }
    trim(type_name::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, sync::Mutex};

    #[derive(Default)]
    struct Pvs(Mutex<HashMap<String, f64>>);
    impl ControlSystem for Pvs {
        fn connect(&self, _pv: &str) -> Result<(), ChannelError> {
            Ok(())
        }
        fn get(&self, pv: &str) -> Result<f64, ChannelError> {
            self.0
                .lock()
                .map_err(|_| ChannelError::Read(pv.into()))?
                .get(pv)
                .copied()
                .ok_or_else(|| ChannelError::Read(pv.into()))
        }
        fn put(&self, pv: &str, value: f64) -> Result<(), ChannelError> {
            self.0
                .lock()
                .map_err(|_| ChannelError::Write {
                    pv: pv.into(),
                    value,
                })?
                .insert(pv.into(), value);
            Ok(())
        }
    }

    #[test]
    fn typed_channels() {
        let cs = Pvs::default();
        let blank: Channel<BlankBeam> = Channel::new("CCL_LLRF:FCM2");
        assert_eq!(blank.pv(), "CCL_LLRF:FCM2:BlnkBeam");
        blank.put(&cs, true).unwrap();
        assert!(blank.get(&cs).unwrap());
        let phase: Channel<CtlPhaseSet> = Channel::new("CCL_LLRF:FCM2");
        phase.put(&cs, -12.5).unwrap();
        assert_eq!(*phase.read(&cs).unwrap(), -12.5);
        let ring: Channel<RingFrequency> = Channel::with_pv("Ring_Diag:BCM_D09:FFT_peak2");
        assert!(ring.get(&cs).is_err());
    }

    #[test]
    fn type_names() {
        assert_eq!(trim_type_name::<Channel<NetPwr>>(), "Channel<NetPwr>");
    }
}
