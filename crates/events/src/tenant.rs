use tally_core::TenantId;

use crate::bus::Delivered;
use crate::record::BusRecord;

/// Helper trait for tenant-scoped messages.
///
/// Marks types carrying a tenant ID so infrastructure components (workers,
/// projections) can filter or validate tenancy without knowing the payload.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

impl<E> TenantScoped for BusRecord<E> {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id()
    }
}

impl<M> TenantScoped for Delivered<M>
where
    M: TenantScoped,
{
    fn tenant_id(&self) -> TenantId {
        self.message.tenant_id()
    }
}
