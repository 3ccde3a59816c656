//! Plan and entitlement administration. Every write is followed by cache
//! invalidation of whatever it could have changed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::error::AppError;
use tracing::{info, instrument};
use uuid::Uuid;

use super::plan_cache::PlanConfigCache;
use super::repository::CatalogRepository;
use crate::models::{
    CreateEntitlement, CreatePlan, Entitlement, EntitlementValue, Plan, PlanWithEntitlements,
    UpdateEntitlement, UpdatePlan,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRemoval {
    Deleted,
    /// Referenced by a subscription or payment, so only deactivated.
    Deactivated,
}

#[derive(Clone)]
pub struct CatalogAdmin {
    catalog: Arc<dyn CatalogRepository>,
    plans: PlanConfigCache,
}

impl CatalogAdmin {
    pub fn new(catalog: Arc<dyn CatalogRepository>, plans: PlanConfigCache) -> Self {
        Self { catalog, plans }
    }

    /// Active plans with their entitlements, cheapest first.
    pub async fn list_active_plans(&self) -> Result<Vec<PlanWithEntitlements>, AppError> {
        let mut resolved = Vec::new();
        for plan in self.catalog.list_active_plans().await? {
            if let Some(plan) = self.plans.get_plan_with_entitlements(plan.plan_id).await? {
                resolved.push(plan);
            }
        }
        Ok(resolved)
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> Result<PlanWithEntitlements, AppError> {
        self.plans
            .get_plan_with_entitlements(plan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Plan not found")))
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_plan(&self, input: &CreatePlan) -> Result<Plan, AppError> {
        let plan = self.catalog.create_plan(input).await?;
        info!(plan_id = %plan.plan_id, "Plan created");
        Ok(plan)
    }

    #[instrument(skip(self, input))]
    pub async fn update_plan(&self, plan_id: Uuid, input: &UpdatePlan) -> Result<Plan, AppError> {
        let plan = self
            .catalog
            .update_plan(plan_id, input)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Plan not found")))?;
        self.plans.invalidate_plan(plan_id).await;
        info!(%plan_id, "Plan updated");
        Ok(plan)
    }

    #[instrument(skip(self))]
    pub async fn delete_plan(&self, plan_id: Uuid) -> Result<PlanRemoval, AppError> {
        if self.catalog.get_plan(plan_id).await?.is_none() {
            return Err(AppError::NotFound(anyhow::anyhow!("Plan not found")));
        }

        let removal = if self.catalog.plan_in_use(plan_id).await? {
            let deactivate = UpdatePlan {
                is_active: Some(false),
                ..UpdatePlan::default()
            };
            self.catalog.update_plan(plan_id, &deactivate).await?;
            PlanRemoval::Deactivated
        } else {
            self.catalog.delete_plan(plan_id).await?;
            PlanRemoval::Deleted
        };

        self.plans.invalidate_plan(plan_id).await;
        info!(%plan_id, ?removal, "Plan removed");
        Ok(removal)
    }

    #[instrument(skip(self, input), fields(feature_key = %input.feature_key))]
    pub async fn create_entitlement(
        &self,
        input: &CreateEntitlement,
    ) -> Result<Entitlement, AppError> {
        let entitlement = self.catalog.create_entitlement(input).await?;
        info!(entitlement_id = %entitlement.entitlement_id, "Entitlement created");
        Ok(entitlement)
    }

    #[instrument(skip(self, input))]
    pub async fn update_entitlement(
        &self,
        entitlement_id: Uuid,
        input: &UpdateEntitlement,
    ) -> Result<Entitlement, AppError> {
        let current = self
            .catalog
            .get_entitlement(entitlement_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Entitlement not found")))?;
        let referencing = self.catalog.plans_with_entitlement(entitlement_id).await?;

        if let Some(kind) = input.entitlement_type {
            if kind != current.kind()? && !referencing.is_empty() {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Type of '{}' cannot change while {} plan(s) use it",
                    current.feature_key,
                    referencing.len()
                )));
            }
        }

        let updated = self
            .catalog
            .update_entitlement(entitlement_id, input)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Entitlement not found")))?;

        self.plans.invalidate_entitlement(entitlement_id).await;
        for plan_id in referencing {
            self.plans.invalidate_plan(plan_id).await;
        }
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn delete_entitlement(&self, entitlement_id: Uuid) -> Result<(), AppError> {
        let referencing = self.catalog.plans_with_entitlement(entitlement_id).await?;
        if !self.catalog.delete_entitlement(entitlement_id).await? {
            return Err(AppError::NotFound(anyhow::anyhow!("Entitlement not found")));
        }

        self.plans.invalidate_entitlement(entitlement_id).await;
        for plan_id in &referencing {
            self.plans.invalidate_plan(*plan_id).await;
        }
        info!(%entitlement_id, plans = referencing.len(), "Entitlement deleted");
        Ok(())
    }

    /// Set a plan's value for an entitlement. The value must have the shape
    /// the entitlement's type expects.
    #[instrument(skip(self, raw))]
    pub async fn set_plan_entitlement(
        &self,
        plan_id: Uuid,
        entitlement_id: Uuid,
        raw: &Value,
    ) -> Result<PlanWithEntitlements, AppError> {
        if self.catalog.get_plan(plan_id).await?.is_none() {
            return Err(AppError::NotFound(anyhow::anyhow!("Plan not found")));
        }
        let entitlement = self
            .catalog
            .get_entitlement(entitlement_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Entitlement not found")))?;

        let value = EntitlementValue::parse(entitlement.kind()?, raw)?;
        self.catalog
            .set_plan_entitlement(plan_id, entitlement_id, &value.to_json())
            .await?;

        self.plans.invalidate_plan(plan_id).await;
        info!(%plan_id, feature_key = %entitlement.feature_key, "Plan entitlement set");
        self.get_plan(plan_id).await
    }

    #[instrument(skip(self))]
    pub async fn remove_plan_entitlement(
        &self,
        plan_id: Uuid,
        entitlement_id: Uuid,
    ) -> Result<(), AppError> {
        if !self
            .catalog
            .remove_plan_entitlement(plan_id, entitlement_id)
            .await?
        {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Plan does not include this entitlement"
            )));
        }
        self.plans.invalidate_plan(plan_id).await;
        Ok(())
    }
}
