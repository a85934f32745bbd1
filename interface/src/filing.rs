//! # Serialization interface
//!
//! Interface to save and to restore the tune-up state as a XML document.

use std::{
    fmt::Debug,
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use crate::xml::{DataAdaptor, XmlError};

#[derive(Debug, thiserror::Error)]
pub enum FilingError {
    #[error("filing error")]
    IO(#[from] std::io::Error),
    #[error("can't create file {1:?}")]
    Create(#[source] std::io::Error, PathBuf),
    #[error("can't open file {1:?}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("XML decoder error")]
    Decoder(#[from] XmlError),
    #[error("unexpected root element {found}, expected {expected}")]
    Root { expected: String, found: String },
}

pub type Result<T> = std::result::Result<T, FilingError>;

/// Encoding to and decoding from a XML element tree
pub trait XmlCodec {
    /// Name of the document root element
    const ROOT: &'static str;
    /// Writes the state into the root element
    fn write_xml(&self, root: &mut DataAdaptor);
    /// Restores the state from the root element
    fn read_xml(&mut self, root: &DataAdaptor) -> std::result::Result<(), XmlError>;

    /// Encodes the state as a XML document
    fn encode<W>(&self, writer: &mut W) -> Result<()>
    where
        W: Write,
    {
        let mut root = DataAdaptor::new(Self::ROOT);
        self.write_xml(&mut root);
        writer.write_all(root.to_xml_string().as_bytes())?;
        Ok(())
    }
    /// Decodes the state from a XML document
    fn decode<R>(&mut self, reader: &mut R) -> Result<()>
    where
        R: Read,
    {
        let mut xml = String::new();
        reader.read_to_string(&mut xml)?;
        let root = DataAdaptor::parse(&xml)?;
        if root.name() != Self::ROOT {
            return Err(FilingError::Root {
                expected: Self::ROOT.into(),
                found: root.name().into(),
            });
        }
        self.read_xml(&root)?;
        Ok(())
    }
}

impl<T: XmlCodec> Filing for T {}

/// Encoding and decoding to/from [File]
pub trait Filing: XmlCodec {
    /// Restores the state from given path
    fn update_from_path<P>(&mut self, path: P) -> Result<()>
    where
        P: AsRef<Path> + Debug,
    {
        log::info!("decoding from {path:?}");
        let file =
            File::open(&path).map_err(|e| FilingError::Open(e, path.as_ref().to_path_buf()))?;
        let mut buffer = std::io::BufReader::new(file);
        self.decode(&mut buffer)
    }

    /// Saves the state to given path
    fn to_path<P>(&self, path: P) -> Result<()>
    where
        P: AsRef<Path> + Debug,
    {
        log::info!("encoding to {path:?}");
        let file =
            File::create(&path).map_err(|e| FilingError::Create(e, path.as_ref().to_path_buf()))?;
        let mut buffer = std::io::BufWriter::new(file);
        self.encode(&mut buffer)?;
        buffer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug, PartialEq)]
    struct Offsets(Vec<f64>);
    impl XmlCodec for Offsets {
        const ROOT: &'static str = "OFFSETS";
        fn write_xml(&self, root: &mut DataAdaptor) {
            root.set_f64_array("values", &self.0);
        }
        fn read_xml(&mut self, root: &DataAdaptor) -> std::result::Result<(), XmlError> {
            self.0 = root.f64_array("values")?;
            Ok(())
        }
    }

    #[test]
    fn file_round_trip() {
        let path = std::env::temp_dir().join("linac-tuneup_interface-filing.xml");
        let offsets = Offsets(vec![0., 5.25, -3.125]);
        offsets.to_path(&path).unwrap();
        let mut back = Offsets::default();
        back.update_from_path(&path).unwrap();
        assert_eq!(back, offsets);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn wrong_root() {
        let mut offsets = Offsets::default();
        let xml = b"<OTHER values=\"1\"/>";
        assert!(matches!(
            offsets.decode(&mut &xml[..]),
            Err(FilingError::Root { .. })
        ));
    }
}
