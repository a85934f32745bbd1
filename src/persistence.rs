//! Saving and restoring the tune-up session
//!
//! The session is the [MainLoop] state: the commit policy, the BPM usage and every cavity
//! controller with its parameters, its cavity settings and its scan data.
//! It is filed as a XML document with [interface::filing::Filing]:
//! ```no_run
//! use interface::filing::Filing;
//! use linac_tuneup::config::TuneUpConfig;
//!
//! let config = TuneUpConfig::default();
//! let mut main_loop = config.main_loop()?;
//! main_loop.to_path("session.xml")?;
//! main_loop.update_from_path("session.xml")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use interface::{filing::XmlCodec, DataAdaptor, XmlError};

use crate::main_loop::MainLoop;

impl XmlCodec for MainLoop {
    const ROOT: &'static str = "WARM_LINAC_TUNE_UP";

    fn write_xml(&self, root: &mut DataAdaptor) {
        MainLoop::write_xml(self, root)
    }
    fn read_xml(&mut self, root: &DataAdaptor) -> Result<(), XmlError> {
        MainLoop::read_xml(self, root)
    }
}
