/// Echo suppression for the local writer.
///
/// Armed synchronously when a local edit is issued; the first store
/// notification that follows disarms it and is discarded, so the store's
/// echo of our own write never clobbers the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoSuppressor {
    armed: bool,
}

impl EchoSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self) {
        self.armed = true;
    }

    /// Disarm, returning whether the suppressor was armed (i.e. whether
    /// the notification at hand should be discarded)
    pub fn disarm(&mut self) -> bool {
        std::mem::take(&mut self.armed)
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disarms_exactly_once() {
        let mut echo = EchoSuppressor::new();
        assert!(!echo.disarm());

        echo.arm();
        echo.arm();
        assert!(echo.is_armed());
        assert!(echo.disarm());
        assert!(!echo.disarm());
    }
}
