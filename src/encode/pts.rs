use crate::foundation::core::Pts;

/// Keeps timestamps fed to an encoder strictly increasing.
///
/// A timestamp that repeats or goes backwards is replaced by the last accepted one plus the last
/// observed frame interval (at least one microsecond).
#[derive(Debug, Default)]
pub struct PtsCorrector {
    last: Option<Pts>,
    interval: i64,
    rewrites: u64,
}

/// What [`PtsCorrector::correct`] did with a timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PtsDecision {
    Accepted(Pts),
    Rewritten { from: Pts, to: Pts },
}

impl PtsDecision {
    pub fn pts(self) -> Pts {
        match self {
            Self::Accepted(p) => p,
            Self::Rewritten { to, .. } => to,
        }
    }
}

impl PtsCorrector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correct(&mut self, pts: Pts) -> PtsDecision {
        let Some(last) = self.last else {
            self.last = Some(pts);
            return PtsDecision::Accepted(pts);
        };
        if pts > last {
            self.interval = pts.0 - last.0;
            self.last = Some(pts);
            return PtsDecision::Accepted(pts);
        }
        let to = Pts(last.0.saturating_add(self.interval.max(1)));
        self.last = Some(to);
        self.rewrites += 1;
        PtsDecision::Rewritten { from: pts, to }
    }

    pub fn rewrites(&self) -> u64 {
        self.rewrites
    }

    pub fn last(&self) -> Option<Pts> {
        self.last
    }
}
