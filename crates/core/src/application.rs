use thiserror::Error;

string_enum! {
    /// Lifecycle of a job application.
    pub enum ApplicationStatus {
        Pending => "pending",
        Reviewing => "reviewing",
        Shortlisted => "shortlisted",
        Accepted => "accepted",
        Rejected => "rejected",
        Withdrawn => "withdrawn",
    }
}

/// Who is asking for a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Applicant,
    Employer,
}

impl ApplicationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Withdrawn)
    }

    /// Statuses reachable from `self` for the given actor.
    pub fn next_statuses(self, actor: Actor) -> &'static [ApplicationStatus] {
        use ApplicationStatus::*;

        match (actor, self) {
            (_, Accepted | Rejected | Withdrawn) => &[],
            (Actor::Applicant, _) => &[Withdrawn],
            (Actor::Employer, Pending) => &[Reviewing, Rejected],
            (Actor::Employer, Reviewing) => &[Shortlisted, Rejected],
            (Actor::Employer, Shortlisted) => &[Accepted, Rejected],
        }
    }

    /// Validates a transition and returns the new status.
    pub fn transition(
        self,
        to: ApplicationStatus,
        actor: Actor,
    ) -> Result<ApplicationStatus, TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal(self));
        }
        if self.next_statuses(actor).contains(&to) {
            Ok(to)
        } else {
            Err(TransitionError::NotAllowed { from: self, to })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("application is already {0}")]
    Terminal(ApplicationStatus),
    #[error("cannot move application from {from} to {to}")]
    NotAllowed {
        from: ApplicationStatus,
        to: ApplicationStatus,
    },
}
