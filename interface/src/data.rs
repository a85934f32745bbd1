use std::{fmt, marker::PhantomData, ops::Deref, sync::Arc};

use super::UniqueIdentifier;

/// Channel data wrapper
///
/// `U` is the channel unique identifier (UID).
pub struct Data<U: UniqueIdentifier>(Arc<<U as UniqueIdentifier>::DataType>, PhantomData<U>);
impl<T, U: UniqueIdentifier<DataType = T>> Deref for Data<U> {
    type Target = T;
    /// Returns a reference to the data
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T, U: UniqueIdentifier<DataType = T>> Clone for Data<U> {
    /// Makes a clone of the inner `Arc` pointer, returning a new instance of `Data<U>` with the cloned [Arc] within
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0), PhantomData)
    }
}

impl<T, U: UniqueIdentifier<DataType = T>> Data<U> {
    /// Moves `data` into an `Arc` pointer and places into `Data<U>`
    pub fn new(data: T) -> Self {
        Data(Arc::new(data), PhantomData)
    }
}

impl<T, U> fmt::Debug for Data<U>
where
    T: fmt::Debug,
    U: UniqueIdentifier<DataType = T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Data")
            .field(&self.0)
            .field(&crate::trim_type_name::<U>())
            .finish()
    }
}

impl<T, U> PartialEq for Data<U>
where
    T: PartialEq,
    U: UniqueIdentifier<DataType = T>,
{
    fn eq(&self, other: &Self) -> bool {
        *self.0 == *other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlankBeam, BpmPhaseAvg};

    #[test]
    fn shared_reading() {
        let phase: Data<BpmPhaseAvg> = Data::new(45.);
        let copy = phase.clone();
        assert_eq!(copy, Data::new(45.));
        assert_eq!(*copy + 1., 46.);
        let blanked: Data<BlankBeam> = Data::new(true);
        assert!(format!("{blanked:?}").contains("BlankBeam"));
    }
}
