//! Class roster lookups.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::{ClassId, UserId};

use super::{read, write};
use crate::error::SagaError;

#[async_trait]
pub trait ClassMembership: Send + Sync {
    async fn student_ids(&self, class_id: ClassId) -> Result<Vec<UserId>, SagaError>;

    async fn counselor_ids(&self, class_id: ClassId) -> Result<Vec<UserId>, SagaError>;
}

#[derive(Debug, Clone, Default)]
struct Roster {
    students: Vec<UserId>,
    counselors: Vec<UserId>,
}

/// In-memory class roster for testing. Unknown classes have no members.
#[derive(Debug, Clone, Default)]
pub struct InMemoryClassMembership {
    rosters: Arc<RwLock<HashMap<ClassId, Roster>>>,
}

impl InMemoryClassMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_roster(&self, class_id: ClassId, students: Vec<UserId>, counselors: Vec<UserId>) {
        write(&self.rosters).insert(
            class_id,
            Roster {
                students,
                counselors,
            },
        );
    }
}

#[async_trait]
impl ClassMembership for InMemoryClassMembership {
    async fn student_ids(&self, class_id: ClassId) -> Result<Vec<UserId>, SagaError> {
        Ok(read(&self.rosters)
            .get(&class_id)
            .map(|r| r.students.clone())
            .unwrap_or_default())
    }

    async fn counselor_ids(&self, class_id: ClassId) -> Result<Vec<UserId>, SagaError> {
        Ok(read(&self.rosters)
            .get(&class_id)
            .map(|r| r.counselors.clone())
            .unwrap_or_default())
    }
}
