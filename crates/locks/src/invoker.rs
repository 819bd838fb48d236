// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of dlock.
//
// dlock is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// dlock is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with dlock. If not, see <https://www.gnu.org/licenses/>.

//! Executes a named-lock call and reads its scalar as a boolean.

use crate::connection::{LockConnection, Primitive};
use crate::LockResult;

/// Run `primitive` on `conn`; true iff the datastore answered exactly 1.
///
/// 0 and NULL are both false. Errors from execution or decoding are
/// returned as-is.
pub async fn invoke<C: LockConnection + ?Sized>(conn: &mut C, primitive: &Primitive<'_>) -> LockResult<bool> {
    let value = conn.query_scalar(primitive).await?;
    Ok(value == Some(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LockError;
    use async_trait::async_trait;

    struct Scripted(LockResult<Option<i64>>);

    #[async_trait]
    impl LockConnection for Scripted {
        async fn query_scalar(&mut self, _primitive: &Primitive<'_>) -> LockResult<Option<i64>> {
            match &self.0 {
                Ok(v) => Ok(*v),
                Err(e) => Err(LockError::PrimitiveError(e.to_string())),
            }
        }

        async fn close(self) -> LockResult<()> {
            Ok(())
        }

        fn abandon(self) {}
    }

    const CALL: Primitive<'static> = Primitive::Release { name: "n" };

    #[tokio::test]
    async fn test_only_one_is_true() {
        assert!(invoke(&mut Scripted(Ok(Some(1))), &CALL).await.unwrap());
        assert!(!invoke(&mut Scripted(Ok(Some(0))), &CALL).await.unwrap());
        assert!(!invoke(&mut Scripted(Ok(Some(2))), &CALL).await.unwrap());
        assert!(!invoke(&mut Scripted(Ok(Some(-1))), &CALL).await.unwrap());
    }

    #[tokio::test]
    async fn test_null_is_false() {
        assert!(!invoke(&mut Scripted(Ok(None)), &CALL).await.unwrap());
    }

    #[tokio::test]
    async fn test_errors_propagate() {
        let result = invoke(&mut Scripted(Err(LockError::PrimitiveError("gone away".into()))), &CALL).await;
        assert!(matches!(result, Err(LockError::PrimitiveError(msg)) if msg.contains("gone away")));
    }
}
