/*
 * Created on Tue Mar 12 2024
 *
 * This file is a part of Lattix
 * Lattix is a free and open-source library of concurrent in-memory index
 * structures (a B+Tree, an adaptive radix tree and an open-addressed hash
 * table) built for predictable performance under heavy multi-threaded
 * read and write workloads.
 *
 * Copyright (c) 2024, the Lattix authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use core::fmt;

pub type RuntimeResult<T> = Result<T, Error>;

/// The only ways any operation in this crate can fail. Transient snapshot
/// staleness is retried internally and never reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// every thread slot up to the compile-time ceiling is taken
    MaxThreadsReached,
    /// a deadlock-safe mutex abandoned its wait after verifying a cycle
    Deadlocked,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxThreadsReached => write!(f, "thread slot ceiling reached"),
            Self::Deadlocked => write!(f, "lock wait abandoned after deadlock verification"),
        }
    }
}

impl std::error::Error for Error {}
