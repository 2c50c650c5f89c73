// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Course catalog.
//!
//! The catalog resolves a course code to its pricing type and price. The
//! purchase engine only ever reads from it.

use crate::base::{CourseCode, CourseId};
use crate::error::CourseError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Pricing type of a course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CourseType {
    /// Always accessible, never billed.
    Free,
    /// Time-boxed access for the configured rental period.
    Rent,
    /// Permanent access.
    Buy,
}

impl CourseType {
    pub fn is_free(self) -> bool {
        self == Self::Free
    }
}

/// A catalog entry.
///
/// Built through [`Course::new`], which guarantees that paid courses carry a
/// positive price and free courses carry none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Course {
    id: CourseId,
    code: CourseCode,
    #[serde(rename = "type")]
    course_type: CourseType,
    price: Option<Decimal>,
}

impl Course {
    pub fn new(
        id: CourseId,
        code: CourseCode,
        course_type: CourseType,
        price: Option<Decimal>,
    ) -> Result<Self, CourseError> {
        match (course_type, price) {
            (CourseType::Free, Some(_)) => return Err(CourseError::UnexpectedPrice),
            (CourseType::Rent | CourseType::Buy, None) => return Err(CourseError::MissingPrice),
            (CourseType::Rent | CourseType::Buy, Some(p)) if p <= Decimal::ZERO => {
                return Err(CourseError::NonPositivePrice);
            }
            _ => {}
        }
        Ok(Self {
            id,
            code,
            course_type,
            price,
        })
    }

    pub fn free(id: CourseId, code: impl Into<CourseCode>) -> Self {
        Self {
            id,
            code: code.into(),
            course_type: CourseType::Free,
            price: None,
        }
    }

    pub fn id(&self) -> CourseId {
        self.id
    }

    pub fn code(&self) -> &CourseCode {
        &self.code
    }

    pub fn course_type(&self) -> CourseType {
        self.course_type
    }

    /// Price to charge. Zero for free courses.
    pub fn price(&self) -> Decimal {
        self.price.unwrap_or(Decimal::ZERO)
    }
}

/// Read-only course lookup consumed by the engine.
pub trait CourseCatalog: Send + Sync {
    fn resolve_by_code(&self, code: &CourseCode) -> Option<Course>;

    /// All courses ordered by id.
    fn courses(&self) -> Vec<Course>;
}

/// A thread-safe in-memory catalog keyed by course code.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    courses: DashMap<CourseCode, Course>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the five demo courses used by the CLI.
    pub fn demo() -> Self {
        let catalog = Self::new();
        let entries = [
            ("00a1", CourseType::Free, None),
            ("00с3", CourseType::Rent, Some(dec!(20))),
            ("032v", CourseType::Buy, Some(dec!(30))),
            ("032у", CourseType::Buy, Some(dec!(40))),
            ("0а2у", CourseType::Rent, Some(dec!(10))),
        ];
        for (id, (code, course_type, price)) in (1u32..).zip(entries) {
            if let Ok(course) = Course::new(CourseId(id), CourseCode::from(code), course_type, price)
            {
                let _ = catalog.insert(course);
            }
        }
        catalog
    }

    /// Adds a course.
    ///
    /// # Errors
    ///
    /// Returns [`CourseError::DuplicateCode`] if the code is already taken.
    pub fn insert(&self, course: Course) -> Result<(), CourseError> {
        match self.courses.entry(course.code.clone()) {
            Entry::Occupied(_) => Err(CourseError::DuplicateCode(course.code)),
            Entry::Vacant(entry) => {
                entry.insert(course);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.courses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
    }
}

impl CourseCatalog for InMemoryCatalog {
    fn resolve_by_code(&self, code: &CourseCode) -> Option<Course> {
        self.courses.get(code).map(|entry| entry.value().clone())
    }

    fn courses(&self) -> Vec<Course> {
        let mut courses: Vec<Course> = self.courses.iter().map(|e| e.value().clone()).collect();
        courses.sort_by_key(Course::id);
        courses
    }
}
