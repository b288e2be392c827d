use thiserror::Error;

use crate::embedding::Embedding;

/// Aligned face crop handed to the embedding model, packed RGB8.
#[derive(Debug, Clone)]
pub struct FaceRegion {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("face region is {width}x{height} with {len} bytes")]
    InvalidRegion { width: u32, height: u32, len: usize },
    #[error("embedding model failed: {0}")]
    Model(String),
}

/// The neural embedding model, injected by the host.
///
/// Implementations may cache loaded weights; `&mut self` lets them reuse
/// inference sessions without interior locking.
pub trait EmbeddingProducer: Send {
    fn produce(&mut self, face: &FaceRegion) -> Result<Embedding, ProducerError>;
}

impl FaceRegion {
    pub fn validate(&self) -> Result<(), ProducerError> {
        let expected = self.width as usize * self.height as usize * 3;
        if self.width == 0 || self.height == 0 || self.rgb.len() != expected {
            return Err(ProducerError::InvalidRegion {
                width: self.width,
                height: self.height,
                len: self.rgb.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_validation() {
        let ok = FaceRegion {
            width: 2,
            height: 2,
            rgb: vec![0; 12],
        };
        assert!(ok.validate().is_ok());

        let short = FaceRegion {
            width: 2,
            height: 2,
            rgb: vec![0; 11],
        };
        assert!(matches!(
            short.validate(),
            Err(ProducerError::InvalidRegion { len: 11, .. })
        ));
    }
}
