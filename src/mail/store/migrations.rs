//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mailroom.
//
// Mailroom is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailroom is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailroom. If not, see <http://www.gnu.org/licenses/>.

use log::info;

use super::types::*;
use crate::support::{error::Error, log_prefix::LogPrefix};

/// Applies whichever of `migrations` have not yet been applied to `cxn`.
///
/// Migration N (1-based) is `migrations[N-1]`. A database whose recorded
/// version is newer than the latest migration is refused.
pub fn apply_migrations(
    log_prefix: &LogPrefix,
    cxn: &mut rusqlite::Connection,
    db_name: &str,
    migrations: &[&str],
) -> Result<(), Error> {
    let latest_version = migrations.len();

    if Ok(Some(latest_version))
        == cxn.query_row(
            "SELECT MAX(`version`) FROM `migration`",
            (),
            from_single::<Option<usize>>,
        )
    {
        return Ok(());
    }

    let txn = cxn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Exclusive)?;
    txn.execute(
        "CREATE TABLE IF NOT EXISTS `migration` (\
         `version` INTEGER NOT NULL PRIMARY KEY, \
         `applied_at` INTEGER NOT NULL\
         ) STRICT",
        (),
    )?;

    let current_version = txn
        .query_row(
            "SELECT MAX(`version`) FROM `migration`",
            (),
            from_single::<Option<usize>>,
        )?
        .unwrap_or(0);

    if current_version > latest_version {
        return Err(Error::UnsupportedSchemaVersion);
    }

    for (version, migration) in migrations
        .iter()
        .copied()
        .enumerate()
        .map(|(ix, migration)| (ix + 1, migration))
        .skip(current_version)
    {
        info!("{log_prefix} Applying #{version} migration to {db_name} DB");
        txn.execute_batch(migration)?;
        txn.execute(
            "INSERT INTO `migration` (`version`, `applied_at`) \
             VALUES (?, ?)",
            (version, UnixTimestamp::now()),
        )?;
    }

    txn.commit()?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    const M1: &str = "CREATE TABLE `foo` (`x` INTEGER NOT NULL) STRICT;";
    const M2: &str = "ALTER TABLE `foo` ADD COLUMN `y` TEXT;";

    fn version(cxn: &rusqlite::Connection) -> usize {
        cxn.query_row(
            "SELECT MAX(`version`) FROM `migration`",
            (),
            from_single::<usize>,
        )
        .unwrap()
    }

    #[test]
    fn migrations_apply_incrementally() {
        let log_prefix = LogPrefix::new("test".to_owned());
        let mut cxn = rusqlite::Connection::open_in_memory().unwrap();

        apply_migrations(&log_prefix, &mut cxn, "test", &[M1]).unwrap();
        assert_eq!(1, version(&cxn));
        // Idempotent
        apply_migrations(&log_prefix, &mut cxn, "test", &[M1]).unwrap();
        assert_eq!(1, version(&cxn));

        apply_migrations(&log_prefix, &mut cxn, "test", &[M1, M2]).unwrap();
        assert_eq!(2, version(&cxn));
        cxn.execute("INSERT INTO `foo` (`x`, `y`) VALUES (1, 'a')", ())
            .unwrap();

        assert_matches!(
            Err(Error::UnsupportedSchemaVersion),
            apply_migrations(&log_prefix, &mut cxn, "test", &[M1]),
        );
    }
}
