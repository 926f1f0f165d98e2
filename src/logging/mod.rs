/**
 * This file is part of devsandbox-proxy.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

pub mod logger;
pub mod record;
pub mod remote;
pub mod warnings;
pub mod writer;

pub use logger::{RecordFields, RequestLogger};
pub use record::RequestLogRecord;
pub use remote::{derive_log_level, FileFanoutRemoteLogWriter, LogLevel, NoopRemoteLogWriter, RemoteLogWriter};
pub use warnings::WarningLog;
pub use writer::RotatingLogWriter;
