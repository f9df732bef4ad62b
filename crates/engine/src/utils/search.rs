// TDB - Trace Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
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

//! Binary searches over sorted step indices.

/// Index of the last element `<= target` in a sorted slice.
///
/// Returns `None` when every element is greater than `target`.
pub fn find_lower_bound(sorted: &[usize], target: usize) -> Option<usize> {
    find_lower_bound_by_key(sorted, target, |v| *v)
}

/// Like [`find_lower_bound`], comparing on a key extracted from each element.
pub fn find_lower_bound_by_key<T>(
    sorted: &[T],
    target: usize,
    key: impl Fn(&T) -> usize,
) -> Option<usize> {
    sorted.partition_point(|item| key(item) <= target).checked_sub(1)
}

/// Value of the last element `<= target`.
pub fn find_lower_bound_value(sorted: &[usize], target: usize) -> Option<usize> {
    find_lower_bound(sorted, target).map(|i| sorted[i])
}

/// Value of the first element `>= target`.
pub fn find_upper_bound_value(sorted: &[usize], target: usize) -> Option<usize> {
    sorted.get(sorted.partition_point(|v| *v < target)).copied()
}
